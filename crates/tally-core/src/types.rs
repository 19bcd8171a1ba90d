//! # Domain Types
//!
//! The record model shared by the queue, the transmitter, the listeners and
//! the local store.
//!
//! ## Record Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SyncRecord.sync_state                            │
//! │                                                                         │
//! │   local write                                                          │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌──────────┐  flush   ┌──────────┐  ack ok   ┌──────────┐             │
//! │  │ Unsynced │ ───────► │ Pending  │ ────────► │  Synced  │             │
//! │  └──────────┘          └────┬─────┘           └──────────┘             │
//! │       ▲                     │ ack failed            ▲                   │
//! │       │                     ▼                       │ inbound change    │
//! │       │ requeue        ┌──────────┐                 │ (origin=remote)   │
//! │       └─────────────── │  Failed  │           remote listener           │
//! │                        └──────────┘                                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Dual-Key Identity
//! - `local_id`: assigned on the device that created the row, never changes
//! - `remote_id`: assigned by the remote store on the first successful write,
//!   never changes once set

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::{CoreError, CoreResult};

/// Ordered field → value mapping carried by every record.
pub type Payload = serde_json::Map<String, serde_json::Value>;

// =============================================================================
// Sync Table
// =============================================================================

/// A synchronized collection.
///
/// Collections are independent: the engine gives no ordering guarantees
/// between tables.
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, TS,
)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum SyncTable {
    Products,
    Categories,
    Sales,
    SaleItems,
    Payments,
    SalesReturns,
    Customers,
    CustomerPayments,
    CreditTransactions,
    Suppliers,
    SupplierPayments,
    PurchaseOrders,
    PurchaseOrderItems,
    PurchaseInvoices,
    PurchaseReturns,
    StockAdjustments,
    Expenses,
    TaxRates,
    Users,
    StoreSettings,
}

impl SyncTable {
    /// Every known collection, in a stable order.
    pub const ALL: [SyncTable; 20] = [
        SyncTable::Products,
        SyncTable::Categories,
        SyncTable::Sales,
        SyncTable::SaleItems,
        SyncTable::Payments,
        SyncTable::SalesReturns,
        SyncTable::Customers,
        SyncTable::CustomerPayments,
        SyncTable::CreditTransactions,
        SyncTable::Suppliers,
        SyncTable::SupplierPayments,
        SyncTable::PurchaseOrders,
        SyncTable::PurchaseOrderItems,
        SyncTable::PurchaseInvoices,
        SyncTable::PurchaseReturns,
        SyncTable::StockAdjustments,
        SyncTable::Expenses,
        SyncTable::TaxRates,
        SyncTable::Users,
        SyncTable::StoreSettings,
    ];

    /// Collection name as used on the wire and in the local store.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncTable::Products => "products",
            SyncTable::Categories => "categories",
            SyncTable::Sales => "sales",
            SyncTable::SaleItems => "sale_items",
            SyncTable::Payments => "payments",
            SyncTable::SalesReturns => "sales_returns",
            SyncTable::Customers => "customers",
            SyncTable::CustomerPayments => "customer_payments",
            SyncTable::CreditTransactions => "credit_transactions",
            SyncTable::Suppliers => "suppliers",
            SyncTable::SupplierPayments => "supplier_payments",
            SyncTable::PurchaseOrders => "purchase_orders",
            SyncTable::PurchaseOrderItems => "purchase_order_items",
            SyncTable::PurchaseInvoices => "purchase_invoices",
            SyncTable::PurchaseReturns => "purchase_returns",
            SyncTable::StockAdjustments => "stock_adjustments",
            SyncTable::Expenses => "expenses",
            SyncTable::TaxRates => "tax_rates",
            SyncTable::Users => "users",
            SyncTable::StoreSettings => "store_settings",
        }
    }
}

impl fmt::Display for SyncTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncTable {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SyncTable::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| CoreError::UnknownTable(s.to_string()))
    }
}

// =============================================================================
// Sync State & Origin
// =============================================================================

/// Per-record synchronization state.
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    /// Written locally, not yet handed to the transmitter.
    #[default]
    Unsynced,
    /// Part of a batch that is currently in flight.
    Pending,
    /// Acknowledged by the remote store (or received from it).
    Synced,
    /// Last transmission attempt failed.
    Failed,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Unsynced => "unsynced",
            SyncState::Pending => "pending",
            SyncState::Synced => "synced",
            SyncState::Failed => "failed",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unsynced" => Ok(SyncState::Unsynced),
            "pending" => Ok(SyncState::Pending),
            "synced" => Ok(SyncState::Synced),
            "failed" => Ok(SyncState::Failed),
            other => Err(CoreError::UnknownState(other.to_string())),
        }
    }
}

/// Where the last mutation of a record came from.
///
/// Rows written by the inbound listener carry `Remote` so they are never
/// echoed back to the remote store.
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    #[default]
    Local,
    Remote,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Local => "local",
            Origin::Remote => "remote",
        }
    }
}

impl FromStr for Origin {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Origin::Local),
            "remote" => Ok(Origin::Remote),
            other => Err(CoreError::UnknownOrigin(other.to_string())),
        }
    }
}

// =============================================================================
// Record Key
// =============================================================================

/// Identity of a record inside the outbound queue: `(table, local_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub table: SyncTable,
    pub local_id: String,
}

impl RecordKey {
    pub fn new(table: SyncTable, local_id: impl Into<String>) -> Self {
        RecordKey {
            table,
            local_id: local_id.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table, self.local_id)
    }
}

// =============================================================================
// Sync Record
// =============================================================================

/// One row of one synchronized table.
///
/// ## Invariants
/// - `table` and `local_id` never change
/// - `remote_id` is only set after a successful transmission, and only once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SyncRecord {
    pub table: SyncTable,
    pub local_id: String,
    pub remote_id: Option<String>,
    #[ts(type = "Record<string, unknown>")]
    pub payload: Payload,
    pub sync_state: SyncState,
    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
    pub origin: Origin,
}

impl SyncRecord {
    /// Creates a fresh, locally authored record with a generated `local_id`.
    pub fn new_local(table: SyncTable, payload: Payload) -> Self {
        Self::with_local_id(table, uuid::Uuid::new_v4().to_string(), payload)
    }

    /// Creates a locally authored record with a caller-chosen `local_id`.
    pub fn with_local_id(table: SyncTable, local_id: impl Into<String>, payload: Payload) -> Self {
        SyncRecord {
            table,
            local_id: local_id.into(),
            remote_id: None,
            payload,
            sync_state: SyncState::Unsynced,
            updated_at: Utc::now(),
            origin: Origin::Local,
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.table, self.local_id.clone())
    }

    pub fn is_synced(&self) -> bool {
        self.sync_state == SyncState::Synced
    }

    /// Applies a local edit: new payload, `unsynced`, origin local, and an
    /// `updated_at` strictly later than the previous one.
    pub fn modify(&mut self, payload: Payload) {
        self.payload = payload;
        self.sync_state = SyncState::Unsynced;
        self.origin = Origin::Local;
        self.touch();
    }

    /// Bumps `updated_at`, guaranteeing it moves forward even when the clock
    /// has not ticked since the last mutation.
    pub fn touch(&mut self) {
        let floor = self.updated_at + Duration::microseconds(1);
        self.updated_at = Utc::now().max(floor);
    }

    /// Records the id assigned by the remote store.
    ///
    /// Re-assigning the same id is a no-op; assigning a different one fails.
    pub fn assign_remote_id(&mut self, remote_id: &str) -> CoreResult<()> {
        match &self.remote_id {
            Some(existing) if existing != remote_id => Err(CoreError::RemoteIdConflict {
                key: self.key().to_string(),
                existing: existing.clone(),
                assigned: remote_id.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                self.remote_id = Some(remote_id.to_string());
                Ok(())
            }
        }
    }

    /// Key used for the remote write: the remote id when known, else the
    /// local id.
    pub fn write_key(&self) -> &str {
        self.remote_id.as_deref().unwrap_or(&self.local_id)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
