use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::product::{group_by_availability, AvailabilityKey, ProductRef};
use crate::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CartStatus {
    Open,
    Ordered,
    Expired,
    Cancelled,
}

impl CartStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CartStatus::Open => "OPEN",
            CartStatus::Ordered => "ORDERED",
            CartStatus::Expired => "EXPIRED",
            CartStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OPEN" => Some(CartStatus::Open),
            "ORDERED" => Some(CartStatus::Ordered),
            "EXPIRED" => Some(CartStatus::Expired),
            "CANCELLED" => Some(CartStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for CartStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller input for a new cart line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCartLine {
    pub product: ProductRef,
    pub package_id: Option<i64>,
    pub availability_id: i64,
    pub quantity: i32,
    pub unit_price_cents: i64,
    pub currency: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// Reservation intent: stock is only promised, never held, until checkout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartLineItem {
    pub id: Uuid,
    pub cart_id: Uuid,
    pub product: ProductRef,
    pub package_id: Option<i64>,
    pub availability_id: i64,
    pub quantity: i32,
    pub unit_price_cents: i64,
    pub currency: String,
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CartLineItem {
    pub fn availability_key(&self) -> Option<AvailabilityKey> {
        self.product
            .kind
            .is_stocked()
            .then(|| AvailabilityKey::new(self.product.kind, self.availability_id))
    }

    pub fn line_total_cents(&self) -> CoreResult<i64> {
        self.unit_price_cents
            .checked_mul(i64::from(self.quantity))
            .ok_or(CoreError::InvalidAmount(self.unit_price_cents))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cart {
    pub id: Uuid,
    pub user_id: i64,
    pub status: CartStatus,
    pub currency: String,
    pub total_cents: i64,
    pub item_count: i32,
    pub items: Vec<CartLineItem>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Cart {
    pub fn new(user_id: i64, currency: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            status: CartStatus::Open,
            currency: currency.into(),
            total_cents: 0,
            item_count: 0,
            items: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn ensure_open(&self) -> CoreResult<()> {
        if self.status != CartStatus::Open {
            return Err(CoreError::InvalidCartState {
                cart_id: self.id,
                status: self.status,
            });
        }
        Ok(())
    }

    /// Adds a line, or merges the quantity into the line already holding the
    /// same availability. Returns the id of the affected line.
    pub fn add_line(&mut self, line: NewCartLine) -> CoreResult<Uuid> {
        self.ensure_open()?;
        if line.quantity <= 0 {
            return Err(CoreError::InvalidQuantity(line.quantity));
        }
        if line.currency != self.currency {
            return Err(CoreError::CurrencyMismatch {
                expected: self.currency.clone(),
                found: line.currency,
            });
        }

        let now = Utc::now();
        let mut items = self.items.clone();
        let existing = items.iter_mut().find(|item| {
            item.product == line.product && item.availability_id == line.availability_id
        });

        let line_id = match existing {
            Some(item) => {
                item.quantity = item
                    .quantity
                    .checked_add(line.quantity)
                    .ok_or(CoreError::InvalidQuantity(line.quantity))?;
                item.updated_at = now;
                item.id
            }
            None => {
                let item = CartLineItem {
                    id: Uuid::new_v4(),
                    cart_id: self.id,
                    product: line.product,
                    package_id: line.package_id,
                    availability_id: line.availability_id,
                    quantity: line.quantity,
                    unit_price_cents: line.unit_price_cents,
                    currency: line.currency,
                    config: line.config,
                    created_at: now,
                    updated_at: now,
                };
                let id = item.id;
                items.push(item);
                id
            }
        };

        self.replace_items(items)?;
        Ok(line_id)
    }

    pub fn set_quantity(&mut self, line_id: Uuid, quantity: i32) -> CoreResult<()> {
        self.ensure_open()?;
        if quantity <= 0 {
            return Err(CoreError::InvalidQuantity(quantity));
        }
        let mut items = self.items.clone();
        let item = items
            .iter_mut()
            .find(|item| item.id == line_id)
            .ok_or(CoreError::CartLineNotFound { cart_id: self.id, line_id })?;
        item.quantity = quantity;
        item.updated_at = Utc::now();
        self.replace_items(items)
    }

    pub fn remove_line(&mut self, line_id: Uuid) -> CoreResult<()> {
        self.ensure_open()?;
        let before = self.items.len();
        let items: Vec<_> = self.items.iter().filter(|item| item.id != line_id).cloned().collect();
        if items.len() == before {
            return Err(CoreError::CartLineNotFound { cart_id: self.id, line_id });
        }
        self.replace_items(items)
    }

    /// Recomputes the denormalized total and unit count. Fails without
    /// touching the cart when either leaves its integer range.
    pub fn recalculate(&mut self) -> CoreResult<()> {
        let (total_cents, item_count) = totals(&self.items)?;
        self.total_cents = total_cents;
        self.item_count = item_count;
        self.updated_at = Utc::now();
        Ok(())
    }

    fn replace_items(&mut self, items: Vec<CartLineItem>) -> CoreResult<()> {
        let (total_cents, item_count) = totals(&items)?;
        self.items = items;
        self.total_cents = total_cents;
        self.item_count = item_count;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn transition(&mut self, status: CartStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Units to reserve at checkout, one entry per availability row.
    pub fn stock_requirements(&self) -> CoreResult<BTreeMap<AvailabilityKey, i32>> {
        group_by_availability(
            self.items
                .iter()
                .filter_map(|item| item.availability_key().map(|key| (key, item.quantity))),
        )
    }
}

fn totals(items: &[CartLineItem]) -> CoreResult<(i64, i32)> {
    items.iter().try_fold((0i64, 0i32), |(cents, units), item| {
        let cents = cents
            .checked_add(item.line_total_cents()?)
            .ok_or(CoreError::InvalidAmount(item.unit_price_cents))?;
        let units = units
            .checked_add(item.quantity)
            .ok_or(CoreError::InvalidQuantity(item.quantity))?;
        Ok((cents, units))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::product::ProductKind;

    fn line(kind: ProductKind, availability_id: i64, quantity: i32, price: i64) -> NewCartLine {
        NewCartLine {
            product: ProductRef::new(kind, 100 + availability_id),
            package_id: None,
            availability_id,
            quantity,
            unit_price_cents: price,
            currency: "USD".to_string(),
            config: serde_json::json!({}),
        }
    }

    #[test]
    fn test_add_line_merges_and_recalculates() {
        let mut cart = Cart::new(1, "USD");

        let first = cart.add_line(line(ProductKind::Activity, 1, 2, 1500)).unwrap();
        let second = cart.add_line(line(ProductKind::Activity, 1, 1, 1500)).unwrap();
        cart.add_line(line(ProductKind::Flight, 3, 1, 20000)).unwrap();

        assert_eq!(first, second);
        assert_eq!(cart.items.len(), 2);
        assert_eq!(cart.item_count, 4);
        assert_eq!(cart.total_cents, 3 * 1500 + 20000);
    }

    #[test]
    fn test_add_line_rejects_bad_input() {
        let mut cart = Cart::new(1, "USD");

        let mut euro = line(ProductKind::Room, 2, 1, 9000);
        euro.currency = "EUR".to_string();
        assert!(matches!(cart.add_line(euro), Err(CoreError::CurrencyMismatch { .. })));
        assert!(matches!(
            cart.add_line(line(ProductKind::Room, 2, 0, 9000)),
            Err(CoreError::InvalidQuantity(0))
        ));

        cart.transition(CartStatus::Expired);
        assert!(matches!(
            cart.add_line(line(ProductKind::Room, 2, 1, 9000)),
            Err(CoreError::InvalidCartState { status: CartStatus::Expired, .. })
        ));
    }

    #[test]
    fn test_stock_requirements_skip_packages() {
        let mut cart = Cart::new(1, "USD");
        cart.add_line(line(ProductKind::Package, 8, 1, 50000)).unwrap();
        let id = cart.add_line(line(ProductKind::Transportation, 5, 2, 3000)).unwrap();
        cart.set_quantity(id, 4).unwrap();

        let needs = cart.stock_requirements().unwrap();
        assert_eq!(needs.len(), 1);
        assert_eq!(needs[&AvailabilityKey::new(ProductKind::Transportation, 5)], 4);
        assert_eq!(cart.total_cents, 50000 + 4 * 3000);
    }

    #[test]
    fn test_merge_overflow_leaves_cart_untouched() {
        let mut cart = Cart::new(1, "USD");
        cart.add_line(line(ProductKind::Activity, 1, i32::MAX, 1)).unwrap();
        let before = cart.clone();

        assert!(matches!(
            cart.add_line(line(ProductKind::Activity, 1, 1, 1)),
            Err(CoreError::InvalidQuantity(1))
        ));
        assert_eq!(cart.items, before.items);
        assert_eq!(cart.item_count, i32::MAX);
    }

    #[test]
    fn test_unit_count_overflow_across_lines() {
        let mut cart = Cart::new(1, "USD");
        cart.add_line(line(ProductKind::Activity, 1, i32::MAX, 1)).unwrap();

        assert!(matches!(
            cart.add_line(line(ProductKind::Flight, 2, 1, 1)),
            Err(CoreError::InvalidQuantity(1))
        ));
        assert_eq!(cart.items.len(), 1);
    }

    #[test]
    fn test_price_overflow_is_rejected() {
        let mut cart = Cart::new(1, "USD");
        let price = i64::MAX / 2 + 1;

        assert!(matches!(
            cart.add_line(line(ProductKind::Room, 2, 2, price)),
            Err(CoreError::InvalidAmount(p)) if p == price
        ));
        assert!(cart.items.is_empty());
        assert_eq!(cart.total_cents, 0);

        let id = cart.add_line(line(ProductKind::Room, 2, 1, price)).unwrap();
        assert!(matches!(cart.set_quantity(id, 2), Err(CoreError::InvalidAmount(_))));
        assert_eq!(cart.items[0].quantity, 1);
        assert_eq!(cart.total_cents, price);

        assert!(matches!(
            cart.add_line(line(ProductKind::Flight, 3, 1, price)),
            Err(CoreError::InvalidAmount(_))
        ));
    }

    #[test]
    fn test_missing_line_names_the_line() {
        let mut cart = Cart::new(1, "USD");
        cart.add_line(line(ProductKind::Activity, 1, 1, 100)).unwrap();
        let ghost = Uuid::new_v4();

        let err = cart.set_quantity(ghost, 2).unwrap_err();
        assert!(matches!(err, CoreError::CartLineNotFound { line_id, .. } if line_id == ghost));
        assert!(err.to_string().contains("line"));
        assert!(matches!(cart.remove_line(ghost), Err(CoreError::CartLineNotFound { .. })));
        assert_eq!(cart.items.len(), 1);
    }
}
