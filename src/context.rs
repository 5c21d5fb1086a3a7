//! Actor, clock and timestamp types threaded through every operation
use chrono::{DateTime, Datelike, TimeZone, Utc};
use std::cmp::Ordering;

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

// ordered by instant, zone types have no ordering
impl<T: TimeZone + Eq> PartialOrd for TimeStamp<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: TimeZone + Eq> Ord for TimeStamp<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn new_with(
        year: i32,
        month: u32,
        day: u32,
        hour: u32,
        min: u32,
        sec: u32,
    ) -> Option<Self> {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .single()
            .map(Self)
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
    /// Calendar year, used to pick the numbering series
    pub fn year(&self) -> i32 {
        self.0.year()
    }
}

impl Default for TimeStamp<Utc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

/// The user on whose behalf an operation runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: String,
    // administrative capability, supplied by the caller's authorization layer
    pub elevated: bool,
}

impl Actor {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            elevated: false,
        }
    }
    pub fn admin(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            elevated: true,
        }
    }
}

/// Who is acting and when. Every mutating service call takes one of these
/// instead of reading an ambient user or the system clock.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub actor: Actor,
    pub now: TimeStamp<Utc>,
}

impl ActionContext {
    pub fn new(actor: Actor, now: TimeStamp<Utc>) -> Self {
        Self { actor, now }
    }

    /// Context stamped with the current system time
    pub fn now(actor: Actor) -> Self {
        Self::new(actor, TimeStamp::new())
    }

    pub fn user_id(&self) -> &str {
        &self.actor.user_id
    }
}

/// Creation and modification stamps carried by every stored record
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Audit {
    #[n(0)]
    pub created_by: String,
    #[n(1)]
    pub created_at: TimeStamp<Utc>,
    #[n(2)]
    pub modified_by: String,
    #[n(3)]
    pub modified_at: TimeStamp<Utc>,
}

impl Audit {
    pub fn created(ctx: &ActionContext) -> Self {
        Self {
            created_by: ctx.actor.user_id.clone(),
            created_at: ctx.now.clone(),
            modified_by: ctx.actor.user_id.clone(),
            modified_at: ctx.now.clone(),
        }
    }

    pub fn touch(&mut self, ctx: &ActionContext) {
        self.modified_by = ctx.actor.user_id.clone();
        self.modified_at = ctx.now.clone();
    }
}
