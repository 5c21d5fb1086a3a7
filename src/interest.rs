//! Partner working interests per well and Joint Interest Billing statements
use super::context::{ActionContext, Audit, TimeStamp};
use super::error::Error;
use chrono::Utc;
use std::fmt;

const FULL_INTEREST: f64 = 100.0;
// summed percentages carry float noise
const INTEREST_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum Consent {
    #[n(0)]
    Pending,
    #[n(1)]
    Consented {
        #[n(0)]
        at: TimeStamp<Utc>,
    },
    #[n(2)]
    NonConsent {
        #[n(0)]
        reason: String,
        #[n(1)]
        at: TimeStamp<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct PartnerInterest {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub partner_id: String,
    #[n(2)]
    pub working_interest: f64,
    #[n(3)]
    pub net_revenue_interest: f64,
    #[n(4)]
    pub consent: Consent,
}

/// Outcome of checking that a well is fully owned
#[derive(Debug, Clone, PartialEq)]
pub struct InterestValidation {
    pub is_valid: bool,
    pub total_working_interest: f64,
    pub message: String,
}

/// All partner interests of one well, stored together so the 100 % ceiling
/// is checked against the same snapshot that gets written.
#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct WellInterests {
    #[n(0)]
    pub well_id: String,
    #[n(1)]
    pub interests: Vec<PartnerInterest>,
    #[n(2)]
    pub audit: Audit,
}

fn check_percentage(name: &str, value: f64) -> Result<(), Error> {
    if !value.is_finite() || value <= 0.0 || value > FULL_INTEREST {
        return Err(Error::validation(format!(
            "{name} must be between 0 and 100, got {value}"
        )));
    }
    Ok(())
}

impl WellInterests {
    pub fn new(well_id: &str, ctx: &ActionContext) -> Self {
        Self {
            well_id: well_id.to_string(),
            interests: vec![],
            audit: Audit::created(ctx),
        }
    }

    pub fn total_working_interest(&self) -> f64 {
        self.interests.iter().map(|pi| pi.working_interest).sum()
    }

    fn total_without(&self, partner_id: &str) -> f64 {
        self.interests
            .iter()
            .filter(|pi| pi.partner_id != partner_id)
            .map(|pi| pi.working_interest)
            .sum()
    }

    fn ensure_within_ceiling(&self, partner_id: &str, working_interest: f64) -> Result<(), Error> {
        let others = self.total_without(partner_id);
        if others + working_interest > FULL_INTEREST + INTEREST_EPSILON {
            return Err(Error::validation(format!(
                "Total working interest would exceed 100% (current: {others}%)"
            )));
        }
        Ok(())
    }

    pub fn interest_of(&self, partner_id: &str) -> Result<&PartnerInterest, Error> {
        self.interests
            .iter()
            .find(|pi| pi.partner_id == partner_id)
            .ok_or_else(|| Error::not_found("partner interest", format!("{}/{partner_id}", self.well_id)))
    }

    fn interest_mut(&mut self, partner_id: &str) -> Result<&mut PartnerInterest, Error> {
        let well_id = self.well_id.clone();
        self.interests
            .iter_mut()
            .find(|pi| pi.partner_id == partner_id)
            .ok_or_else(|| Error::not_found("partner interest", format!("{well_id}/{partner_id}")))
    }

    /// Net revenue interest defaults to the working interest.
    pub fn add(
        &mut self,
        id: String,
        partner_id: &str,
        working_interest: f64,
        net_revenue_interest: Option<f64>,
    ) -> Result<&PartnerInterest, Error> {
        if partner_id.trim().is_empty() {
            return Err(Error::validation("Partner reference is required"));
        }
        check_percentage("Working interest", working_interest)?;
        let nri = net_revenue_interest.unwrap_or(working_interest);
        check_percentage("Net revenue interest", nri)?;
        if self.interests.iter().any(|pi| pi.partner_id == partner_id) {
            return Err(Error::Conflict(format!(
                "Partner {partner_id} already holds an interest in well {}",
                self.well_id
            )));
        }
        self.ensure_within_ceiling(partner_id, working_interest)?;

        self.interests.push(PartnerInterest {
            id,
            partner_id: partner_id.to_string(),
            working_interest,
            net_revenue_interest: nri,
            consent: Consent::Pending,
        });
        let idx = self.interests.len() - 1;
        Ok(&self.interests[idx])
    }

    pub fn update(
        &mut self,
        partner_id: &str,
        working_interest: f64,
        net_revenue_interest: Option<f64>,
    ) -> Result<&PartnerInterest, Error> {
        check_percentage("Working interest", working_interest)?;
        if let Some(nri) = net_revenue_interest {
            check_percentage("Net revenue interest", nri)?;
        }
        self.interest_of(partner_id)?;
        self.ensure_within_ceiling(partner_id, working_interest)?;

        let interest = self.interest_mut(partner_id)?;
        interest.working_interest = working_interest;
        if let Some(nri) = net_revenue_interest {
            interest.net_revenue_interest = nri;
        }
        Ok(interest)
    }

    pub fn remove(&mut self, partner_id: &str) -> Result<PartnerInterest, Error> {
        let idx = self
            .interests
            .iter()
            .position(|pi| pi.partner_id == partner_id)
            .ok_or_else(|| Error::not_found("partner interest", format!("{}/{partner_id}", self.well_id)))?;
        Ok(self.interests.remove(idx))
    }

    pub fn grant_consent(&mut self, partner_id: &str, now: TimeStamp<Utc>) -> Result<&PartnerInterest, Error> {
        let interest = self.interest_mut(partner_id)?;
        interest.consent = Consent::Consented { at: now };
        Ok(interest)
    }

    pub fn mark_non_consent(
        &mut self,
        partner_id: &str,
        reason: &str,
        now: TimeStamp<Utc>,
    ) -> Result<&PartnerInterest, Error> {
        if reason.trim().is_empty() {
            return Err(Error::validation("Non-consent reason is required"));
        }
        let interest = self.interest_mut(partner_id)?;
        interest.consent = Consent::NonConsent {
            reason: reason.to_string(),
            at: now,
        };
        Ok(interest)
    }

    pub fn validate(&self) -> InterestValidation {
        validate_interests(&self.interests)
    }
}

/// A well is fully owned when its working interests sum to 100 %
pub fn validate_interests(interests: &[PartnerInterest]) -> InterestValidation {
    let total: f64 = interests.iter().map(|pi| pi.working_interest).sum();
    let is_valid = (total - FULL_INTEREST).abs() <= INTEREST_EPSILON;
    let message = if is_valid {
        "Working interests sum to 100%".to_string()
    } else {
        format!("Working interests sum to {total}%, should be 100%")
    };
    InterestValidation {
        is_valid,
        total_working_interest: total,
        message,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum JibStatus {
    #[n(0)]
    Draft,
    #[n(1)]
    Sent,
    #[n(2)]
    Paid,
    #[n(3)]
    Disputed,
}

impl fmt::Display for JibStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JibStatus::Draft => "Draft",
            JibStatus::Sent => "Sent",
            JibStatus::Paid => "Paid",
            JibStatus::Disputed => "Disputed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct JibLineItem {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub description: String,
    #[n(2)]
    pub cost_element: Option<String>,
    #[n(3)]
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct JibStatement {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub statement_number: String,
    #[n(2)]
    pub well_id: String,
    #[n(3)]
    pub partner_id: String,
    #[n(4)]
    pub period_from: TimeStamp<Utc>,
    #[n(5)]
    pub period_to: TimeStamp<Utc>,
    #[n(6)]
    pub status: JibStatus,
    #[n(7)]
    pub line_items: Vec<JibLineItem>,
    #[n(8)]
    pub total_amount: f64,
    #[n(9)]
    pub partner_share: f64,
    #[n(10)]
    pub calculated_at: Option<TimeStamp<Utc>>,
    #[n(11)]
    pub sent_at: Option<TimeStamp<Utc>>,
    #[n(12)]
    pub sent_by: Option<String>,
    #[n(13)]
    pub paid_at: Option<TimeStamp<Utc>>,
    #[n(14)]
    pub payment_reference: Option<String>,
    #[n(15)]
    pub disputed_at: Option<TimeStamp<Utc>>,
    #[n(16)]
    pub dispute_reason: Option<String>,
    #[n(17)]
    pub audit: Audit,
}

pub(crate) fn validate_period(from: &TimeStamp<Utc>, to: &TimeStamp<Utc>) -> Result<(), Error> {
    if from > to {
        return Err(Error::validation("Billing period start must not be after its end"));
    }
    Ok(())
}

impl JibStatement {
    pub(crate) fn draft(
        id: String,
        statement_number: String,
        well_id: &str,
        partner_id: &str,
        period_from: TimeStamp<Utc>,
        period_to: TimeStamp<Utc>,
        ctx: &ActionContext,
    ) -> Self {
        Self {
            id,
            statement_number,
            well_id: well_id.to_string(),
            partner_id: partner_id.to_string(),
            period_from,
            period_to,
            status: JibStatus::Draft,
            line_items: vec![],
            total_amount: 0.0,
            partner_share: 0.0,
            calculated_at: None,
            sent_at: None,
            sent_by: None,
            paid_at: None,
            payment_reference: None,
            disputed_at: None,
            dispute_reason: None,
            audit: Audit::created(ctx),
        }
    }

    /// Business key: one statement per partner, well and billing period
    pub fn period_key(&self) -> String {
        period_key(&self.well_id, &self.partner_id, &self.period_from, &self.period_to)
    }

    fn ensure_status(&self, expected: JibStatus, action: &'static str) -> Result<(), Error> {
        if self.status != expected {
            return Err(Error::state("JIB statement", action, self.status));
        }
        Ok(())
    }

    pub(crate) fn add_line_item(
        &mut self,
        id: String,
        description: &str,
        cost_element: Option<String>,
        amount: f64,
    ) -> Result<&JibLineItem, Error> {
        self.ensure_status(JibStatus::Draft, "add line items to")?;
        if description.trim().is_empty() {
            return Err(Error::validation("Description is required"));
        }
        if !amount.is_finite() {
            return Err(Error::validation("Line item amount must be a number"));
        }
        self.line_items.push(JibLineItem {
            id,
            description: description.to_string(),
            cost_element,
            amount,
        });
        // figures are stale until recalculated
        self.calculated_at = None;
        let idx = self.line_items.len() - 1;
        Ok(&self.line_items[idx])
    }

    /// Total of the lines and the partner's share of it. A partner without
    /// an interest in the well is an error, never a zero share.
    pub(crate) fn calculate(&mut self, interests: &WellInterests, now: TimeStamp<Utc>) -> Result<(), Error> {
        self.ensure_status(JibStatus::Draft, "calculate")?;
        let interest = interests.interest_of(&self.partner_id)?;
        self.total_amount = self.line_items.iter().map(|li| li.amount).sum();
        self.partner_share = self.total_amount * interest.working_interest / FULL_INTEREST;
        self.calculated_at = Some(now);
        Ok(())
    }

    pub(crate) fn send(&mut self, ctx: &ActionContext) -> Result<(), Error> {
        self.ensure_status(JibStatus::Draft, "send")?;
        if self.calculated_at.is_none() {
            return Err(Error::validation(
                "JIB statement must be calculated before it is sent",
            ));
        }
        self.status = JibStatus::Sent;
        self.sent_at = Some(ctx.now.clone());
        self.sent_by = Some(ctx.actor.user_id.clone());
        Ok(())
    }

    pub(crate) fn mark_paid(&mut self, payment_reference: &str, now: TimeStamp<Utc>) -> Result<(), Error> {
        self.ensure_status(JibStatus::Sent, "mark paid")?;
        if payment_reference.trim().is_empty() {
            return Err(Error::validation("Payment reference is required"));
        }
        self.status = JibStatus::Paid;
        self.paid_at = Some(now);
        self.payment_reference = Some(payment_reference.to_string());
        Ok(())
    }

    pub(crate) fn mark_disputed(&mut self, reason: &str, now: TimeStamp<Utc>) -> Result<(), Error> {
        self.ensure_status(JibStatus::Sent, "dispute")?;
        if reason.trim().is_empty() {
            return Err(Error::validation("Dispute reason is required"));
        }
        self.status = JibStatus::Disputed;
        self.disputed_at = Some(now);
        self.dispute_reason = Some(reason.to_string());
        Ok(())
    }
}

pub(crate) fn period_key(
    well_id: &str,
    partner_id: &str,
    from: &TimeStamp<Utc>,
    to: &TimeStamp<Utc>,
) -> String {
    format!(
        "{well_id}/{partner_id}/{}/{}",
        from.to_datetime_utc().timestamp(),
        to.to_datetime_utc().timestamp()
    )
}

#[derive(Debug)]
pub struct JibFailure {
    pub partner_id: String,
    pub error: Error,
}

/// Statements created by one generation run. Partners are processed
/// independently; a failure for one does not undo the others.
#[derive(Debug, Default)]
pub struct JibGenerationReport {
    pub created: Vec<JibStatement>,
    pub failures: Vec<JibFailure>,
}
