use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::{CoreError, CoreResult};

/// Sellable product families. The first four are backed by an availability
/// ledger; packages are bundles priced as a unit and carry no stock of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductKind {
    Activity,
    Transportation,
    Room,
    Flight,
    Package,
}

impl ProductKind {
    pub const STOCKED: [ProductKind; 4] = [
        ProductKind::Activity,
        ProductKind::Transportation,
        ProductKind::Room,
        ProductKind::Flight,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProductKind::Activity => "activity",
            ProductKind::Transportation => "transportation",
            ProductKind::Room => "room",
            ProductKind::Flight => "flight",
            ProductKind::Package => "package",
        }
    }

    pub fn is_stocked(&self) -> bool {
        !matches!(self, ProductKind::Package)
    }
}

impl fmt::Display for ProductKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProductKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "activity" => Ok(ProductKind::Activity),
            "transportation" => Ok(ProductKind::Transportation),
            // lodgment is the catalog's name for room stock
            "room" | "lodgment" => Ok(ProductKind::Room),
            "flight" => Ok(ProductKind::Flight),
            "package" => Ok(ProductKind::Package),
            other => Err(CoreError::UnknownProductType(other.to_string())),
        }
    }
}

/// Identifies one availability row. Ordering is (kind, id), which is also the
/// canonical lock acquisition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AvailabilityKey {
    pub kind: ProductKind,
    pub id: i64,
}

impl AvailabilityKey {
    pub fn new(kind: ProductKind, id: i64) -> Self {
        Self { kind, id }
    }
}

impl fmt::Display for AvailabilityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind, self.id)
    }
}

/// Reference to a catalog entry, resolved by the catalog layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProductRef {
    pub kind: ProductKind,
    pub metadata_id: i64,
}

impl ProductRef {
    pub fn new(kind: ProductKind, metadata_id: i64) -> Self {
        Self { kind, metadata_id }
    }
}

/// Sums quantities per availability row, returned in canonical lock order.
/// A sum that leaves the `i32` range is rejected as an invalid quantity.
pub fn group_by_availability<I>(lines: I) -> CoreResult<BTreeMap<AvailabilityKey, i32>>
where
    I: IntoIterator<Item = (AvailabilityKey, i32)>,
{
    let mut grouped = BTreeMap::new();
    for (key, quantity) in lines {
        let units = grouped.entry(key).or_insert(0);
        *units = i32::checked_add(*units, quantity).ok_or(CoreError::InvalidQuantity(quantity))?;
    }
    Ok(grouped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_product_kind() {
        assert_eq!("Activity".parse::<ProductKind>().unwrap(), ProductKind::Activity);
        assert_eq!("lodgment".parse::<ProductKind>().unwrap(), ProductKind::Room);
        assert!(matches!(
            "cruise".parse::<ProductKind>(),
            Err(CoreError::UnknownProductType(t)) if t == "cruise"
        ));
    }

    #[test]
    fn test_grouping_is_canonically_ordered() {
        let flight = AvailabilityKey::new(ProductKind::Flight, 1);
        let act_9 = AvailabilityKey::new(ProductKind::Activity, 9);
        let act_2 = AvailabilityKey::new(ProductKind::Activity, 2);

        let grouped =
            group_by_availability(vec![(flight, 1), (act_9, 2), (act_2, 1), (act_9, 3)]).unwrap();
        let keys: Vec<_> = grouped.keys().copied().collect();

        assert_eq!(keys, vec![act_2, act_9, flight]);
        assert_eq!(grouped[&act_9], 5);
    }

    #[test]
    fn test_grouping_rejects_overflowing_sum() {
        let key = AvailabilityKey::new(ProductKind::Room, 4);
        assert!(matches!(
            group_by_availability(vec![(key, i32::MAX), (key, 1)]),
            Err(CoreError::InvalidQuantity(1))
        ));
    }
}
