use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, Transaction};
use uuid::Uuid;

use reserva_domain::booking::{Booking, BookingFilter, BookingHistory, BookingStatus};
use reserva_domain::error::StoreError;
use reserva_domain::slot::Slot;
use reserva_domain::store::{
    BookingStore, IdempotencyLedger, InsertOutcome, LedgerKey, MoveOutcome, ReserveOutcome,
    SlotMove, SlotPatch, SlotStore, StatusChange, TransitionOutcome,
};

/// Postgres-backed store. Capacity mutation is a single conditional UPDATE
/// (compare-and-swap at the storage layer); the composite booking operations
/// run ledger, capacity and booking writes in one transaction.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

const RESERVE_SQL: &str = "UPDATE slots \
     SET available_bookings = available_bookings - 1, updated_at = NOW() \
     WHERE id = $1 AND tenant_id = $2 \
       AND is_available AND available_bookings > 0 AND start_at > $3";

const RELEASE_SQL: &str = "UPDATE slots \
     SET available_bookings = LEAST(available_bookings + 1, max_bookings), updated_at = NOW() \
     WHERE id = $1 AND tenant_id = $2";

const LEDGER_SQL: &str = "INSERT INTO processed_events (event_id, consumer) \
     VALUES ($1, $2) ON CONFLICT DO NOTHING";

const BOOKING_COLS: &str = "id, customer_id, service_id, slot_id, provider_id, tenant_id, \
     status, amount_minor, currency, notes, created_at, updated_at, \
     cancelled_at, cancelled_by, cancellation_reason";

const SLOT_COLS: &str = "id, service_id, provider_id, tenant_id, start_at, end_at, \
     max_bookings, available_bookings, is_available, is_recurring, created_at, updated_at";

impl PgStore {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(db_err)?;
        Ok(Self { pool })
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies the schema migrations bundled with this crate.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    /// Inserts the ledger row; false means the (event, consumer) pair was
    /// already recorded.
    async fn gate_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        key: &LedgerKey,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(LEDGER_SQL)
            .bind(key.event_id)
            .bind(key.consumer)
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn reserve_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        tenant_id: Uuid,
        slot_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(RESERVE_SQL)
            .bind(slot_id)
            .bind(tenant_id)
            .bind(now)
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        tenant_id: Uuid,
        slot_id: Uuid,
    ) -> Result<(), StoreError> {
        sqlx::query(RELEASE_SQL)
            .bind(slot_id)
            .bind(tenant_id)
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn lock_booking(
        tx: &mut Transaction<'_, Postgres>,
        tenant_id: Uuid,
        booking_id: Uuid,
    ) -> Result<Option<Booking>, StoreError> {
        let sql = format!(
            "SELECT {BOOKING_COLS} FROM bookings WHERE id = $1 AND tenant_id = $2 FOR UPDATE"
        );
        let row = sqlx::query_as::<_, BookingRow>(&sql)
            .bind(booking_id)
            .bind(tenant_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(db_err)?;
        row.map(BookingRow::into_booking).transpose()
    }

    async fn insert_history(
        tx: &mut Transaction<'_, Postgres>,
        history: &BookingHistory,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO booking_history \
             (id, booking_id, tenant_id, old_status, new_status, changed_by, reason, changed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(history.id)
        .bind(history.booking_id)
        .bind(history.tenant_id)
        .bind(history.old_status.map(|s| s.as_str()))
        .bind(history.new_status.as_str())
        .bind(history.changed_by)
        .bind(&history.reason)
        .bind(history.changed_at)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl IdempotencyLedger for PgStore {
    async fn seen(&self, key: &LedgerKey) -> Result<bool, StoreError> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM processed_events WHERE event_id = $1 AND consumer = $2)",
        )
        .bind(key.event_id)
        .bind(key.consumer)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }
}

#[async_trait]
impl SlotStore for PgStore {
    async fn get_slot(&self, tenant_id: Uuid, slot_id: Uuid) -> Result<Option<Slot>, StoreError> {
        let sql = format!("SELECT {SLOT_COLS} FROM slots WHERE id = $1 AND tenant_id = $2");
        let row = sqlx::query_as::<_, SlotRow>(&sql)
            .bind(slot_id)
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.map(SlotRow::into_slot))
    }

    async fn insert_slots(&self, slots: &[Slot]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for slot in slots {
            sqlx::query(
                "INSERT INTO slots \
                 (id, service_id, provider_id, tenant_id, start_at, end_at, max_bookings, \
                  available_bookings, is_available, is_recurring, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
            )
            .bind(slot.id)
            .bind(slot.service_id)
            .bind(slot.provider_id)
            .bind(slot.tenant_id)
            .bind(slot.start_at)
            .bind(slot.end_at)
            .bind(slot.max_bookings)
            .bind(slot.available_bookings)
            .bind(slot.is_available)
            .bind(slot.is_recurring)
            .bind(slot.created_at)
            .bind(slot.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)
    }

    async fn update_slot(
        &self,
        tenant_id: Uuid,
        slot_id: Uuid,
        patch: &SlotPatch,
    ) -> Result<Option<Slot>, StoreError> {
        // The counter is recomputed from the row's current booked count in
        // the same statement, never taken from the caller.
        let sql = format!(
            "UPDATE slots SET \
               start_at = COALESCE($3, start_at), \
               end_at = COALESCE($4, end_at), \
               available_bookings = CASE WHEN $5::int IS NULL THEN available_bookings \
                 ELSE GREATEST($5 - (max_bookings - available_bookings), 0) END, \
               max_bookings = COALESCE($5, max_bookings), \
               is_available = COALESCE($6, is_available), \
               updated_at = $7 \
             WHERE id = $1 AND tenant_id = $2 \
             RETURNING {SLOT_COLS}"
        );
        let row = sqlx::query_as::<_, SlotRow>(&sql)
            .bind(slot_id)
            .bind(tenant_id)
            .bind(patch.start_at)
            .bind(patch.end_at)
            .bind(patch.max_bookings)
            .bind(patch.is_available)
            .bind(patch.updated_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.map(SlotRow::into_slot))
    }

    async fn delete_slot(&self, tenant_id: Uuid, slot_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM slots WHERE id = $1 AND tenant_id = $2")
            .bind(slot_id)
            .bind(tenant_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn slot_has_bookings(
        &self,
        tenant_id: Uuid,
        slot_id: Uuid,
    ) -> Result<bool, StoreError> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM bookings WHERE slot_id = $1 AND tenant_id = $2)",
        )
        .bind(slot_id)
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn has_overlap(
        &self,
        tenant_id: Uuid,
        service_id: Uuid,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM slots \
             WHERE tenant_id = $1 AND service_id = $2 AND start_at < $4 AND end_at > $3)",
        )
        .bind(tenant_id)
        .bind(service_id)
        .bind(start_at)
        .bind(end_at)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn reserve(
        &self,
        tenant_id: Uuid,
        slot_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ReserveOutcome, StoreError> {
        let result = sqlx::query(RESERVE_SQL)
            .bind(slot_id)
            .bind(tenant_id)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() > 0 {
            Ok(ReserveOutcome::Reserved)
        } else {
            Ok(ReserveOutcome::Unavailable)
        }
    }

    async fn release(&self, tenant_id: Uuid, slot_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(RELEASE_SQL)
            .bind(slot_id)
            .bind(tenant_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn set_available(
        &self,
        tenant_id: Uuid,
        slot_id: Uuid,
        available: bool,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE slots SET is_available = $3, updated_at = NOW() \
             WHERE id = $1 AND tenant_id = $2",
        )
        .bind(slot_id)
        .bind(tenant_id)
        .bind(available)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl BookingStore for PgStore {
    async fn get_booking(
        &self,
        tenant_id: Uuid,
        booking_id: Uuid,
    ) -> Result<Option<Booking>, StoreError> {
        let sql =
            format!("SELECT {BOOKING_COLS} FROM bookings WHERE id = $1 AND tenant_id = $2");
        let row = sqlx::query_as::<_, BookingRow>(&sql)
            .bind(booking_id)
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(BookingRow::into_booking).transpose()
    }

    async fn customer_has_booking(
        &self,
        tenant_id: Uuid,
        customer_id: Uuid,
        slot_id: Uuid,
    ) -> Result<bool, StoreError> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM bookings \
             WHERE tenant_id = $1 AND customer_id = $2 AND slot_id = $3)",
        )
        .bind(tenant_id)
        .bind(customer_id)
        .bind(slot_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn insert_pending(
        &self,
        gate: &LedgerKey,
        booking: &Booking,
        history: &BookingHistory,
        now: DateTime<Utc>,
    ) -> Result<InsertOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        if !Self::gate_in_tx(&mut tx, gate).await? {
            // Dropping the transaction rolls it back; nothing was written.
            return Ok(InsertOutcome::AlreadyProcessed);
        }
        if !Self::reserve_in_tx(&mut tx, booking.tenant_id, booking.slot_id, now).await? {
            return Ok(InsertOutcome::CapacityExhausted);
        }

        sqlx::query(
            "INSERT INTO bookings \
             (id, customer_id, service_id, slot_id, provider_id, tenant_id, status, \
              amount_minor, currency, notes, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(booking.id)
        .bind(booking.customer_id)
        .bind(booking.service_id)
        .bind(booking.slot_id)
        .bind(booking.provider_id)
        .bind(booking.tenant_id)
        .bind(booking.status.as_str())
        .bind(booking.amount_minor)
        .bind(&booking.currency)
        .bind(&booking.notes)
        .bind(booking.created_at)
        .bind(booking.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        Self::insert_history(&mut tx, history).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(InsertOutcome::Inserted)
    }

    async fn transition(
        &self,
        gate: Option<&LedgerKey>,
        change: &StatusChange,
    ) -> Result<TransitionOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        if let Some(key) = gate {
            if !Self::gate_in_tx(&mut tx, key).await? {
                return Ok(TransitionOutcome::AlreadyProcessed);
            }
        }

        let Some(mut booking) =
            Self::lock_booking(&mut tx, change.tenant_id, change.booking_id).await?
        else {
            return Ok(TransitionOutcome::NotFound);
        };
        let old_status = booking.status;
        if !change.allowed_from.contains(&old_status) {
            return Ok(TransitionOutcome::WrongState(old_status));
        }

        if change.is_cancellation {
            sqlx::query(
                "UPDATE bookings SET status = $3, updated_at = $4, cancelled_at = $4, \
                 cancelled_by = $5, cancellation_reason = $6 \
                 WHERE id = $1 AND tenant_id = $2",
            )
            .bind(change.booking_id)
            .bind(change.tenant_id)
            .bind(change.to.as_str())
            .bind(change.changed_at)
            .bind(change.changed_by)
            .bind(&change.reason)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            booking.cancelled_at = Some(change.changed_at);
            booking.cancelled_by = Some(change.changed_by);
            booking.cancellation_reason = change.reason.clone();
        } else {
            sqlx::query(
                "UPDATE bookings SET status = $3, updated_at = $4 \
                 WHERE id = $1 AND tenant_id = $2",
            )
            .bind(change.booking_id)
            .bind(change.tenant_id)
            .bind(change.to.as_str())
            .bind(change.changed_at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        booking.status = change.to;
        booking.updated_at = change.changed_at;

        Self::insert_history(
            &mut tx,
            &BookingHistory {
                id: Uuid::new_v4(),
                booking_id: change.booking_id,
                tenant_id: change.tenant_id,
                old_status: Some(old_status),
                new_status: change.to,
                changed_by: change.changed_by,
                reason: change.reason.clone(),
                changed_at: change.changed_at,
            },
        )
        .await?;

        if let Some(slot_id) = change.release_slot {
            Self::release_in_tx(&mut tx, change.tenant_id, slot_id).await?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(TransitionOutcome::Applied(booking))
    }

    async fn move_slot(&self, change: &SlotMove) -> Result<MoveOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let Some(mut booking) =
            Self::lock_booking(&mut tx, change.tenant_id, change.booking_id).await?
        else {
            return Ok(MoveOutcome::NotFound);
        };
        if !change.allowed_from.contains(&booking.status) {
            return Ok(MoveOutcome::WrongState(booking.status));
        }

        if !Self::reserve_in_tx(&mut tx, change.tenant_id, change.new_slot_id, change.changed_at)
            .await?
        {
            return Ok(MoveOutcome::CapacityExhausted);
        }
        Self::release_in_tx(&mut tx, change.tenant_id, change.old_slot_id).await?;

        sqlx::query(
            "UPDATE bookings SET slot_id = $3, updated_at = $4 WHERE id = $1 AND tenant_id = $2",
        )
        .bind(change.booking_id)
        .bind(change.tenant_id)
        .bind(change.new_slot_id)
        .bind(change.changed_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        booking.slot_id = change.new_slot_id;
        booking.updated_at = change.changed_at;

        Self::insert_history(
            &mut tx,
            &BookingHistory {
                id: Uuid::new_v4(),
                booking_id: change.booking_id,
                tenant_id: change.tenant_id,
                old_status: Some(booking.status),
                new_status: booking.status,
                changed_by: change.changed_by,
                reason: change.reason.clone(),
                changed_at: change.changed_at,
            },
        )
        .await?;

        tx.commit().await.map_err(db_err)?;
        Ok(MoveOutcome::Applied(booking))
    }

    async fn list_bookings(
        &self,
        tenant_id: Uuid,
        filter: &BookingFilter,
    ) -> Result<Vec<Booking>, StoreError> {
        let sql = format!(
            "SELECT {BOOKING_COLS} FROM bookings \
             WHERE tenant_id = $1 \
               AND ($2::uuid IS NULL OR customer_id = $2) \
               AND ($3::uuid IS NULL OR service_id = $3) \
               AND ($4::text IS NULL OR status = $4) \
               AND ($5::timestamptz IS NULL OR created_at >= $5) \
               AND ($6::timestamptz IS NULL OR created_at <= $6) \
             ORDER BY created_at"
        );
        let rows = sqlx::query_as::<_, BookingRow>(&sql)
            .bind(tenant_id)
            .bind(filter.customer_id)
            .bind(filter.service_id)
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.from)
            .bind(filter.to)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.into_iter().map(BookingRow::into_booking).collect()
    }

    async fn booking_history(
        &self,
        tenant_id: Uuid,
        booking_id: Uuid,
    ) -> Result<Vec<BookingHistory>, StoreError> {
        let rows = sqlx::query_as::<_, HistoryRow>(
            "SELECT id, booking_id, tenant_id, old_status, new_status, changed_by, \
             reason, changed_at \
             FROM booking_history WHERE booking_id = $1 AND tenant_id = $2 \
             ORDER BY changed_at",
        )
        .bind(booking_id)
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(HistoryRow::into_history).collect()
    }

    async fn confirmed_started_before(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Booking>, StoreError> {
        let sql = format!(
            "SELECT {BOOKING_COLS} FROM bookings \
             WHERE status = 'Confirmed' \
               AND slot_id IN (SELECT id FROM slots WHERE start_at <= $1) \
             ORDER BY created_at LIMIT $2"
        );
        let rows = sqlx::query_as::<_, BookingRow>(&sql)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.into_iter().map(BookingRow::into_booking).collect()
    }
}

#[derive(FromRow)]
struct BookingRow {
    id: Uuid,
    customer_id: Uuid,
    service_id: Uuid,
    slot_id: Uuid,
    provider_id: Uuid,
    tenant_id: Uuid,
    status: String,
    amount_minor: i64,
    currency: String,
    notes: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    cancelled_at: Option<DateTime<Utc>>,
    cancelled_by: Option<Uuid>,
    cancellation_reason: Option<String>,
}

impl BookingRow {
    fn into_booking(self) -> Result<Booking, StoreError> {
        let status = parse_status(&self.status)?;
        Ok(Booking {
            id: self.id,
            customer_id: self.customer_id,
            service_id: self.service_id,
            slot_id: self.slot_id,
            provider_id: self.provider_id,
            tenant_id: self.tenant_id,
            status,
            amount_minor: self.amount_minor,
            currency: self.currency,
            notes: self.notes,
            created_at: self.created_at,
            updated_at: self.updated_at,
            cancelled_at: self.cancelled_at,
            cancelled_by: self.cancelled_by,
            cancellation_reason: self.cancellation_reason,
        })
    }
}

#[derive(FromRow)]
struct SlotRow {
    id: Uuid,
    service_id: Uuid,
    provider_id: Uuid,
    tenant_id: Uuid,
    start_at: DateTime<Utc>,
    end_at: DateTime<Utc>,
    max_bookings: i32,
    available_bookings: i32,
    is_available: bool,
    is_recurring: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl SlotRow {
    fn into_slot(self) -> Slot {
        Slot {
            id: self.id,
            service_id: self.service_id,
            provider_id: self.provider_id,
            tenant_id: self.tenant_id,
            start_at: self.start_at,
            end_at: self.end_at,
            max_bookings: self.max_bookings,
            available_bookings: self.available_bookings,
            is_available: self.is_available,
            is_recurring: self.is_recurring,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(FromRow)]
struct HistoryRow {
    id: Uuid,
    booking_id: Uuid,
    tenant_id: Uuid,
    old_status: Option<String>,
    new_status: String,
    changed_by: Uuid,
    reason: Option<String>,
    changed_at: DateTime<Utc>,
}

impl HistoryRow {
    fn into_history(self) -> Result<BookingHistory, StoreError> {
        let old_status = self.old_status.as_deref().map(parse_status).transpose()?;
        let new_status = parse_status(&self.new_status)?;
        Ok(BookingHistory {
            id: self.id,
            booking_id: self.booking_id,
            tenant_id: self.tenant_id,
            old_status,
            new_status,
            changed_by: self.changed_by,
            reason: self.reason,
            changed_at: self.changed_at,
        })
    }
}

fn parse_status(s: &str) -> Result<BookingStatus, StoreError> {
    BookingStatus::parse(s)
        .ok_or_else(|| StoreError::Database(format!("unknown booking status '{s}'")))
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}
