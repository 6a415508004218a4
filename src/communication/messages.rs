use serde::{Deserialize, Serialize};

use crate::data_structures::IntersectionId;

/// Operator commands accepted on the manual override channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverrideAction {
    ForceGreen,
    ForceRed,
    ForceYellow,
    EmergencyOverride,
    /// Drop queued requests and return the intersection to all red.
    ResetToSafe,
    /// The intersection is blocked. It is held red until cleared.
    ReportIncident,
    ClearIncident,
}

/// A manual override as it arrives from an operator console or the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualOverride {
    pub intersection: IntersectionId,
    /// Approach group index. When absent the active group is used, else group 0.
    #[serde(default)]
    pub group: Option<usize>,
    pub action: OverrideAction,
}

impl ManualOverride {
    pub fn new(intersection: IntersectionId, group: Option<usize>, action: OverrideAction) -> Self {
        Self {
            intersection,
            group,
            action,
        }
    }
}
