use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ShipmentStatus {
    #[default]
    Pending,
    #[serde(rename = "Order Picked")]
    OrderPicked,
    #[serde(rename = "In Transit")]
    InTransit,
    Delivered,
    Failed,
}

impl ShipmentStatus {
    pub const ALL: [ShipmentStatus; 5] = [
        Self::Pending,
        Self::OrderPicked,
        Self::InTransit,
        Self::Delivered,
        Self::Failed,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::OrderPicked => "Order Picked",
            Self::InTransit => "In Transit",
            Self::Delivered => "Delivered",
            Self::Failed => "Failed",
        }
    }

    /// Normal forward progression of a parcel.
    pub fn next_steps(self) -> &'static [ShipmentStatus] {
        match self {
            Self::Pending => &[Self::OrderPicked, Self::Failed],
            Self::OrderPicked => &[Self::InTransit, Self::Failed],
            Self::InTransit => &[Self::Delivered, Self::Failed],
            Self::Delivered | Self::Failed => &[],
        }
    }
}

impl fmt::Display for ShipmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown shipment status {0:?}")]
pub struct UnknownStatus(pub String);

impl FromStr for ShipmentStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|it| it.label() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// How an administrator's status change is checked.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransitionPolicy {
    /// Any label from any label.
    #[default]
    Override,
    /// Only the steps listed by [`ShipmentStatus::next_steps`].
    Guarded,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown transition policy {0:?}")]
pub struct UnknownPolicy(pub String);

impl FromStr for TransitionPolicy {
    type Err = UnknownPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "override" => Ok(Self::Override),
            "guarded" => Ok(Self::Guarded),
            other => Err(UnknownPolicy(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("cannot move a shipment from {from} to {to}")]
pub struct IllegalTransition {
    pub from: ShipmentStatus,
    pub to: ShipmentStatus,
}

impl TransitionPolicy {
    pub fn check(self, from: ShipmentStatus, to: ShipmentStatus) -> Result<(), IllegalTransition> {
        match self {
            Self::Override => Ok(()),
            Self::Guarded if from.next_steps().contains(&to) => Ok(()),
            Self::Guarded => Err(IllegalTransition { from, to }),
        }
    }
}
