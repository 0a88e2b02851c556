use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use orderflow_core::{CouponId, CourseId, Currency, ValueObject};

use crate::error::CouponError;

const MAX_CODE_LEN: usize = 64;

/// Normalised coupon code.
///
/// Codes are trimmed and ASCII-uppercased both when a coupon is written and
/// when a customer types one in, so `save10`, ` SAVE10 ` and `SAVE10` are the
/// same coupon.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CouponCode(String);

impl CouponCode {
    pub fn parse(raw: &str) -> Result<Self, CouponError> {
        let code = raw.trim().to_ascii_uppercase();
        if code.is_empty() {
            return Err(CouponError::InvalidCode("code must not be empty".into()));
        }
        if code.len() > MAX_CODE_LEN {
            return Err(CouponError::InvalidCode(format!(
                "code must be at most {MAX_CODE_LEN} characters"
            )));
        }
        if !code
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(CouponError::InvalidCode(format!(
                "{code:?} contains unsupported characters"
            )));
        }
        Ok(Self(code))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl ValueObject for CouponCode {}

impl TryFrom<String> for CouponCode {
    type Error = CouponError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CouponCode> for String {
    fn from(value: CouponCode) -> Self {
        value.0
    }
}

impl core::fmt::Display for CouponCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a coupon takes off. A coupon is either a percentage or a fixed amount,
/// never both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Discount {
    Percentage { percent_off: u8 },
    FixedAmount { amount_off: i64, currency: Currency },
}

impl Discount {
    pub fn kind(&self) -> &'static str {
        match self {
            Discount::Percentage { .. } => "percentage",
            Discount::FixedAmount { .. } => "fixed_amount",
        }
    }
}

/// Which courses a coupon may be used for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "ids", rename_all = "snake_case")]
pub enum Applicability {
    All,
    Specific(Vec<CourseId>),
    /// Category ids. Category membership is resolved elsewhere, so these
    /// coupons are accepted for any course.
    Category(Vec<Uuid>),
}

impl Applicability {
    pub fn mode(&self) -> &'static str {
        match self {
            Applicability::All => "all",
            Applicability::Specific(_) => "specific",
            Applicability::Category(_) => "category",
        }
    }
}

/// Input for defining a coupon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCoupon {
    pub id: CouponId,
    pub code: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub discount: Discount,
    pub max_redemptions: Option<u32>,
    pub max_redemptions_per_user: Option<u32>,
    pub minimum_amount: Option<i64>,
    pub applicability: Applicability,
    pub first_time_only: bool,
    pub valid_from: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

/// A validated coupon definition plus its running redemption counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Coupon {
    id: CouponId,
    code: CouponCode,
    name: Option<String>,
    description: Option<String>,
    discount: Discount,
    max_redemptions: Option<u32>,
    max_redemptions_per_user: Option<u32>,
    redemption_count: u32,
    minimum_amount: Option<i64>,
    applicability: Applicability,
    first_time_only: bool,
    valid_from: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    is_active: bool,
}

impl Coupon {
    /// Validate a definition. The redemption counter starts at zero.
    pub fn new(def: NewCoupon) -> Result<Self, CouponError> {
        Self::restore(def, 0)
    }

    /// Rebuild a stored coupon with its persisted counter.
    pub fn restore(def: NewCoupon, redemption_count: u32) -> Result<Self, CouponError> {
        let code = CouponCode::parse(&def.code)?;

        match &def.discount {
            Discount::Percentage { percent_off } => {
                if !(1..=100).contains(percent_off) {
                    return Err(CouponError::invalid("percent_off must be between 1 and 100"));
                }
            }
            Discount::FixedAmount { amount_off, .. } => {
                if *amount_off <= 0 {
                    return Err(CouponError::invalid("amount_off must be positive"));
                }
            }
        }

        if matches!(def.max_redemptions, Some(0)) || matches!(def.max_redemptions_per_user, Some(0)) {
            return Err(CouponError::invalid("redemption caps must be positive when set"));
        }
        if let Some(cap) = def.max_redemptions {
            if redemption_count > cap {
                return Err(CouponError::invalid("redemption count exceeds the global cap"));
            }
        }
        if matches!(def.minimum_amount, Some(m) if m < 0) {
            return Err(CouponError::invalid("minimum_amount must not be negative"));
        }
        if matches!(&def.applicability, Applicability::Specific(ids) if ids.is_empty()) {
            return Err(CouponError::invalid("specific applicability needs at least one course"));
        }
        if matches!(def.expires_at, Some(end) if end <= def.valid_from) {
            return Err(CouponError::invalid("expires_at must be after valid_from"));
        }

        Ok(Self {
            id: def.id,
            code,
            name: def.name,
            description: def.description,
            discount: def.discount,
            max_redemptions: def.max_redemptions,
            max_redemptions_per_user: def.max_redemptions_per_user,
            redemption_count,
            minimum_amount: def.minimum_amount,
            applicability: def.applicability,
            first_time_only: def.first_time_only,
            valid_from: def.valid_from,
            expires_at: def.expires_at,
            is_active: def.is_active,
        })
    }

    pub fn id(&self) -> CouponId {
        self.id
    }

    pub fn code(&self) -> &CouponCode {
        &self.code
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn discount(&self) -> &Discount {
        &self.discount
    }

    pub fn max_redemptions(&self) -> Option<u32> {
        self.max_redemptions
    }

    pub fn max_redemptions_per_user(&self) -> Option<u32> {
        self.max_redemptions_per_user
    }

    pub fn redemption_count(&self) -> u32 {
        self.redemption_count
    }

    pub fn minimum_amount(&self) -> Option<i64> {
        self.minimum_amount
    }

    pub fn applicability(&self) -> &Applicability {
        &self.applicability
    }

    pub fn first_time_only(&self) -> bool {
        self.first_time_only
    }

    pub fn valid_from(&self) -> DateTime<Utc> {
        self.valid_from
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self.max_redemptions, Some(cap) if self.redemption_count >= cap)
    }

    /// Count one redemption, refusing to pass the global cap.
    pub fn record_redemption(&mut self) -> Result<(), CouponError> {
        if self.is_exhausted() {
            return Err(CouponError::CouponUsageExceeded);
        }
        self.redemption_count += 1;
        Ok(())
    }

    pub fn deactivate(&mut self) {
        self.is_active = false;
    }
}
