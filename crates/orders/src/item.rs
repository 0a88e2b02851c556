use serde::{Deserialize, Serialize};

use orderflow_core::{CourseId, Entity, OrderItemId};

use crate::error::OrderError;

/// Kind of purchasable catalog entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    Course,
    Bundle,
    Subscription,
}

impl ItemType {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemType::Course => "course",
            ItemType::Bundle => "bundle",
            ItemType::Subscription => "subscription",
        }
    }
}

impl core::str::FromStr for ItemType {
    type Err = OrderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "course" => Ok(ItemType::Course),
            "bundle" => Ok(ItemType::Bundle),
            "subscription" => Ok(ItemType::Subscription),
            other => Err(OrderError::InvalidItem(format!("unknown item type {other:?}"))),
        }
    }
}

/// Frozen snapshot of a catalog entry at order time.
///
/// Later catalog price or title changes never touch existing orders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: OrderItemId,
    pub catalog_id: CourseId,
    pub item_type: ItemType,
    pub title: String,
    pub description: Option<String>,
    /// Price charged per unit (minor units).
    pub unit_price: i64,
    /// Catalog list price before any catalog-side markdown (minor units).
    pub original_price: i64,
    pub quantity: u32,
}

impl OrderItem {
    pub fn line_total(&self) -> Option<i64> {
        self.unit_price.checked_mul(i64::from(self.quantity))
    }

    pub(crate) fn validate(&self) -> Result<(), OrderError> {
        if self.quantity == 0 {
            return Err(OrderError::InvalidItem(format!("{}: quantity must be positive", self.catalog_id)));
        }
        if self.unit_price < 0 || self.original_price < 0 {
            return Err(OrderError::InvalidItem(format!("{}: prices must not be negative", self.catalog_id)));
        }
        if self.title.trim().is_empty() {
            return Err(OrderError::InvalidItem(format!("{}: title must not be empty", self.catalog_id)));
        }
        Ok(())
    }
}

impl Entity for OrderItem {
    type Id = OrderItemId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}
