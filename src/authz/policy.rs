//! 静态策略：未配置授权服务时使用（仅开发环境）

use std::collections::HashSet;

use async_trait::async_trait;

use crate::authz::{
    AuthzClient, AuthzDecision, AuthzError, AuthzRequest, Verdict, ACTION_TOOL_INVOKE,
};

/// 默认放行；可按 principal 或工具名拒绝。决策不带有效期，每次都重新判定
#[derive(Debug, Default, Clone)]
pub struct StaticPolicy {
    deny_principals: HashSet<String>,
    deny_tools: HashSet<String>,
}

impl StaticPolicy {
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn deny_principal(mut self, principal: impl Into<String>) -> Self {
        self.deny_principals.insert(principal.into());
        self
    }

    pub fn deny_tool(mut self, tool: impl Into<String>) -> Self {
        self.deny_tools.insert(tool.into());
        self
    }

    fn denial(&self, request: &AuthzRequest) -> Option<String> {
        if self.deny_principals.contains(&request.principal) {
            return Some(format!("principal {} is denied", request.principal));
        }
        if request.action == ACTION_TOOL_INVOKE {
            let tool = request
                .resource
                .strip_prefix("tool:")
                .and_then(|r| r.split('#').next())
                .unwrap_or_default();
            if self.deny_tools.contains(tool) {
                return Some(format!("tool {tool} is denied"));
            }
        }
        None
    }
}

#[async_trait]
impl AuthzClient for StaticPolicy {
    async fn check(&self, request: &AuthzRequest) -> Result<AuthzDecision, AuthzError> {
        let reason = self.denial(request);
        Ok(AuthzDecision {
            principal: request.principal.clone(),
            action: request.action.clone(),
            resource: request.resource.clone(),
            verdict: if reason.is_some() {
                Verdict::Deny
            } else {
                Verdict::Allow
            },
            valid_until: None,
            constraints: None,
            reason,
        })
    }
}
