// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory approval store: same contract, no durability.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;

use crate::{ApprovalError, ApprovalRecord, ApprovalState, ApprovalStore};

/// Mutex-guarded approval store for single-process use.
#[derive(Default)]
pub struct MemoryApprovalStore {
    records: Mutex<HashMap<String, ApprovalRecord>>,
}

impl MemoryApprovalStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ApprovalStore for MemoryApprovalStore {
    fn put_pending(&self, record: ApprovalRecord) -> Result<(), ApprovalError> {
        self.records
            .lock()
            .expect("approval store poisoned")
            .insert(record.approval_id.clone(), record);
        Ok(())
    }

    fn resolve(
        &self,
        approval_id: &str,
        approved: bool,
        approver_id: Option<&str>,
    ) -> Result<ApprovalRecord, ApprovalError> {
        let mut records = self.records.lock().expect("approval store poisoned");
        let record = records
            .get_mut(approval_id)
            .ok_or_else(|| ApprovalError::Unknown {
                approval_id: approval_id.to_string(),
            })?;
        if record.state != ApprovalState::Pending {
            return Err(ApprovalError::InvalidState {
                approval_id: approval_id.to_string(),
                state: record.state.as_str(),
            });
        }
        let now = Utc::now();
        if record.is_expired(now) {
            record.state = ApprovalState::Expired;
            record.resolved_at = Some(now);
            record.approved = false;
            return Ok(record.clone());
        }
        record.state = if approved {
            ApprovalState::Approved
        } else {
            ApprovalState::Denied
        };
        record.approved = approved;
        record.approver_id = approver_id.map(str::to_string);
        record.resolved_at = Some(now);
        Ok(record.clone())
    }

    fn get(&self, approval_id: &str) -> Result<Option<ApprovalRecord>, ApprovalError> {
        Ok(self
            .records
            .lock()
            .expect("approval store poisoned")
            .get(approval_id)
            .cloned())
    }

    fn get_by_request(&self, request_id: &str) -> Result<Option<ApprovalRecord>, ApprovalError> {
        Ok(self
            .records
            .lock()
            .expect("approval store poisoned")
            .values()
            .find(|r| r.binding.request_id == request_id)
            .cloned())
    }

    fn sweep_expired(&self) -> Result<usize, ApprovalError> {
        let mut records = self.records.lock().expect("approval store poisoned");
        let now = Utc::now();
        let mut moved = 0usize;
        for record in records.values_mut() {
            if record.state == ApprovalState::Pending && record.is_expired(now) {
                record.state = ApprovalState::Expired;
                record.resolved_at = Some(now);
                record.approved = false;
                moved += 1;
            }
        }
        Ok(moved)
    }
}
