//! 每任务的决策账本与授权闸门
//!
//! 账本只保存带有效期的决策；锁从不跨 await 持有。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;

use crate::authz::{AuthzClient, AuthzDecision, AuthzError, AuthzRequest};

#[derive(Debug, Default)]
pub struct DecisionLedger {
    decisions: Mutex<Vec<AuthzDecision>>,
}

impl DecisionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// 查找仍覆盖该请求的决策，顺带清理已过期的
    pub fn lookup(&self, request: &AuthzRequest) -> Option<AuthzDecision> {
        let now = Utc::now();
        let mut decisions = self.decisions.lock().ok()?;
        decisions.retain(|d| d.valid_until.is_some_and(|until| until > now));
        decisions.iter().find(|d| d.covers(request, now)).cloned()
    }

    pub fn record(&self, decision: &AuthzDecision) {
        if decision.valid_until.is_none() {
            return;
        }
        if let Ok(mut decisions) = self.decisions.lock() {
            decisions.push(decision.clone());
        }
    }
}

/// 授权闸门：先查账本，否则带超时请求授权客户端
#[derive(Clone)]
pub struct AuthzGate {
    client: Arc<dyn AuthzClient>,
    timeout: Duration,
}

impl AuthzGate {
    pub fn new(client: Arc<dyn AuthzClient>, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    pub async fn check(
        &self,
        ledger: &DecisionLedger,
        request: &AuthzRequest,
    ) -> Result<AuthzDecision, AuthzError> {
        if let Some(decision) = ledger.lookup(request) {
            tracing::debug!(resource = %request.resource, "Reusing authorization decision");
            return Ok(decision);
        }
        let decision = tokio::time::timeout(self.timeout, self.client.check(request))
            .await
            .map_err(|_| {
                AuthzError::Unavailable(format!(
                    "no decision within {} ms",
                    self.timeout.as_millis()
                ))
            })??;
        ledger.record(&decision);
        Ok(decision)
    }
}
