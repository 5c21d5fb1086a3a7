//! Service layer API for the well cost workflows
//!
//! Every mutating call takes an [`ActionContext`] and follows the same cycle:
//! load a snapshot, validate, apply the change and its roll-ups to a copy,
//! then compare-and-swap the copy over the snapshot. Nothing is written when
//! any step fails.
mod afe;
mod economics;
mod financial;

pub use afe::PendingApprovalItem;
pub use economics::AnalysisRequest;

use super::afe::Afe;
use super::config::{EngineConfig, SeriesFormat};
use super::context::ActionContext;
use super::economics::EconomicsAnalysis;
use super::error::Error;
use super::interest::{JibStatement, WellInterests};
use super::store::Store;
use super::utils::{format_document_number, new_uuid_to_bech32};
use std::sync::Arc;

pub struct WellCostService {
    store: Store,
    config: EngineConfig,
}

impl WellCostService {
    pub fn new(instance: Arc<sled::Db>, config: EngineConfig) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            store: Store::open(instance)?,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    fn new_id(hrp: &str) -> Result<String, Error> {
        Ok(new_uuid_to_bech32(hrp)?)
    }

    fn next_number(&self, series: &SeriesFormat, year: i32) -> Result<String, Error> {
        let sequence = self.store.next_sequence(&series.prefix, year)?;
        Ok(format_document_number(
            &series.prefix,
            year,
            sequence,
            series.width,
        ))
    }

    /// Read-modify-write of one AFE. Totals are re-aggregated after every
    /// change and written in the same swap.
    fn modify_afe<R>(
        &self,
        afe_id: &str,
        ctx: &ActionContext,
        change: impl FnOnce(&mut Afe) -> Result<R, Error>,
    ) -> Result<(Afe, R), Error> {
        let snapshot = self.store.afes.load(afe_id)?;
        let mut afe = snapshot.value.clone();
        let outcome = change(&mut afe)?;
        afe.recompute_totals(self.config.variance.threshold_pct);
        afe.audit.touch(ctx);
        self.store.afes.replace(&snapshot, &afe)?;
        Ok((afe, outcome))
    }

    fn modify_analysis(
        &self,
        analysis_id: &str,
        ctx: &ActionContext,
        change: impl FnOnce(&mut EconomicsAnalysis) -> Result<(), Error>,
    ) -> Result<EconomicsAnalysis, Error> {
        let snapshot = self.store.analyses.load(analysis_id)?;
        let mut analysis = snapshot.value.clone();
        change(&mut analysis)?;
        analysis.audit.touch(ctx);
        self.store.analyses.replace(&snapshot, &analysis)?;
        Ok(analysis)
    }

    fn modify_interests(
        &self,
        well_id: &str,
        ctx: &ActionContext,
        change: impl FnOnce(&mut WellInterests) -> Result<(), Error>,
    ) -> Result<WellInterests, Error> {
        let snapshot = self.store.interests.load(well_id)?;
        let mut interests = snapshot.value.clone();
        change(&mut interests)?;
        interests.audit.touch(ctx);
        self.store.interests.replace(&snapshot, &interests)?;
        Ok(interests)
    }

    fn modify_jib(
        &self,
        statement_id: &str,
        ctx: &ActionContext,
        change: impl FnOnce(&mut JibStatement) -> Result<(), Error>,
    ) -> Result<JibStatement, Error> {
        let snapshot = self.store.jib.load(statement_id)?;
        let mut statement = snapshot.value.clone();
        change(&mut statement)?;
        statement.audit.touch(ctx);
        self.store.jib.replace(&snapshot, &statement)?;
        Ok(statement)
    }
}
