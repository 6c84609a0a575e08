//! Columns
//!
//! A column owns no storage of its own; its values are part of the entity's
//! rows. Its sub-unit mediates access to the column's statistics: changes are
//! buffered and reach the statistics manager only when the transaction
//! commits.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::statistics::ColumnStatistic;
use crate::transaction::{Dbo, Event, LockMode, SubUnit, Transaction};
use crate::values::Type;

use super::registry::CatalogueObject;
use super::{name_key, CatalogueContext, ColumnName, DatabaseError, DatabaseResult, Name, Retired, ENTITIES_STORE};

/// Definition of a column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub value_type: Type,
    #[serde(default)]
    pub nullable: bool,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, value_type: Type) -> Self {
        Self {
            name: name.into().to_lowercase(),
            value_type,
            nullable: false,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

pub struct Column {
    name: ColumnName,
    def: ColumnDef,
    position: usize,
    ctx: Arc<CatalogueContext>,
    retired: Retired,
}

impl Column {
    pub(crate) fn new(name: ColumnName, def: ColumnDef, position: usize, ctx: Arc<CatalogueContext>) -> Arc<Self> {
        Arc::new(Self {
            name,
            def,
            position,
            ctx,
            retired: Retired::default(),
        })
    }

    pub fn column_name(&self) -> &ColumnName {
        &self.name
    }

    pub fn def(&self) -> &ColumnDef {
        &self.def
    }

    pub fn value_type(&self) -> Type {
        self.def.value_type
    }

    /// Position of this column's value in a row
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn is_retired(&self) -> bool {
        self.retired.get()
    }
}

impl CatalogueObject for Column {
    fn publish(&self) {
        self.ctx
            .statistics
            .register_column(self.name.clone(), self.def.value_type);
    }

    fn retire(&self) {
        if self.retired.set() {
            self.ctx.statistics.remove_column(&self.name);
        }
    }
}

impl Dbo for Column {
    type SubUnit = ColumnSubUnit;

    fn name(&self) -> Name {
        Name::Column(self.name.clone())
    }

    fn new_sub_unit(self: Arc<Self>, tx: &Transaction) -> DatabaseResult<ColumnSubUnit> {
        let key = name_key(&self.name.entity());
        let visible = tx.with_storage(|s| Ok(s.get(ENTITIES_STORE, &key)?.is_some()))?;
        if self.is_retired() || !visible {
            return Err(DatabaseError::ColumnDoesNotExist(self.name.clone()));
        }
        Ok(ColumnSubUnit {
            column: self,
            tx: tx.clone(),
            pending: Mutex::new(Pending::default()),
        })
    }
}

#[derive(Debug, Default)]
struct Pending {
    stale: bool,
    updated: Option<ColumnStatistic>,
    /// Stale-mark checkpoint `updated` was computed after
    checkpoint: Option<u64>,
}

/// A column as seen by one transaction
pub struct ColumnSubUnit {
    column: Arc<Column>,
    tx: Transaction,
    pending: Mutex<Pending>,
}

impl ColumnSubUnit {
    pub fn column(&self) -> &Arc<Column> {
        &self.column
    }

    /// Statistics of this column, including changes made by this transaction
    pub fn statistics(&self) -> DatabaseResult<ColumnStatistic> {
        self.tx.request_lock(&self.column.name(), LockMode::Shared)?;
        let pending = self.pending.lock();
        if let Some(updated) = &pending.updated {
            return Ok(updated.clone());
        }
        let mut statistic = self
            .column
            .ctx
            .statistics
            .column(&self.column.name)
            .unwrap_or_else(|| ColumnStatistic::empty(self.column.name.clone(), self.column.value_type()));
        if pending.stale {
            statistic.fresh = false;
        }
        Ok(statistic)
    }

    /// Record that data of this column changed.
    ///
    /// Signals `ColumnStale` if the statistics were fresh, once per
    /// transaction.
    pub fn mark_stale(&self) -> DatabaseResult<()> {
        self.tx.request_lock(&self.column.name(), LockMode::Shared)?;
        let was_fresh = {
            let mut pending = self.pending.lock();
            if pending.stale {
                return Ok(());
            }
            pending.stale = true;
            pending.checkpoint = None;
            match pending.updated.take() {
                Some(updated) => updated.fresh,
                None => self.column.ctx.statistics.is_fresh(&self.column.name),
            }
        };
        if was_fresh {
            self.tx.signal_event(Event::ColumnStale {
                column: self.column.name.clone(),
            });
        }
        Ok(())
    }

    /// Replace the statistics of this column
    pub fn update_statistics(&self, statistic: ColumnStatistic) -> DatabaseResult<()> {
        self.stage_update(statistic, None)
    }

    /// Replace the statistics with ones computed from a snapshot opened
    /// after the stale-mark `checkpoint`.
    ///
    /// If the column is marked stale after `checkpoint` by the time this
    /// transaction commits, the statistic is published as not fresh.
    pub fn update_statistics_since(&self, statistic: ColumnStatistic, checkpoint: u64) -> DatabaseResult<()> {
        self.stage_update(statistic, Some(checkpoint))
    }

    fn stage_update(&self, statistic: ColumnStatistic, checkpoint: Option<u64>) -> DatabaseResult<()> {
        if statistic.column != self.column.name {
            return Err(DatabaseError::validation(format!(
                "statistic of {} cannot be stored for {}",
                statistic.column, self.column.name
            )));
        }
        self.tx.request_lock(&self.column.name(), LockMode::Exclusive)?;
        let mut pending = self.pending.lock();
        pending.stale = false;
        pending.updated = Some(statistic);
        pending.checkpoint = checkpoint;
        Ok(())
    }
}

impl SubUnit for ColumnSubUnit {
    fn dbo_name(&self) -> Name {
        self.column.name()
    }

    fn finalize(&self, committed: bool) {
        let pending = std::mem::take(&mut *self.pending.lock());
        if !committed {
            return;
        }
        let statistics = &self.column.ctx.statistics;
        match (pending.updated, pending.checkpoint) {
            (Some(updated), Some(checkpoint)) => {
                if !statistics.update_column_since(updated, checkpoint) {
                    debug!(column = %self.column.name, "column changed after its snapshot, kept stale");
                }
            }
            (Some(updated), None) => statistics.update_column(updated),
            (None, _) => {}
        }
        if pending.stale {
            statistics.mark_column_stale(&self.column.name);
        }
    }
}
