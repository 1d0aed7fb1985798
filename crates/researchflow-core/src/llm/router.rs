use std::sync::Arc;

use super::{LlmClient, LlmError, LlmRequest, LlmResponse};

/// Which provider tier a task needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskCriticality {
    /// Requirements extraction, SQL generation: primary provider only.
    Critical,
    /// Drafting emails and agendas: secondary first, primary as fallback.
    NonCritical,
}

#[derive(Clone, Default)]
pub struct LlmRouter {
    primary: Option<Arc<dyn LlmClient>>,
    secondary: Option<Arc<dyn LlmClient>>,
}

impl LlmRouter {
    pub fn new(primary: Option<Arc<dyn LlmClient>>, secondary: Option<Arc<dyn LlmClient>>) -> Self {
        Self { primary, secondary }
    }

    /// A router with no providers; every call returns `NotConfigured`.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn has_primary(&self) -> bool {
        self.primary.is_some()
    }

    pub fn is_configured(&self) -> bool {
        self.primary.is_some() || self.secondary.is_some()
    }

    pub async fn complete(
        &self,
        criticality: TaskCriticality,
        request: &LlmRequest,
    ) -> Result<LlmResponse, LlmError> {
        match criticality {
            TaskCriticality::Critical => match &self.primary {
                Some(client) => client.complete(request).await,
                None => Err(LlmError::NotConfigured),
            },
            TaskCriticality::NonCritical => {
                if let Some(secondary) = &self.secondary {
                    match secondary.complete(request).await {
                        Ok(response) => return Ok(response),
                        Err(e) if self.primary.is_some() => {
                            tracing::warn!(
                                "[LlmRouter] {} failed ({}), falling back to primary",
                                secondary.name(),
                                e
                            );
                        }
                        Err(e) => return Err(e),
                    }
                }
                match &self.primary {
                    Some(client) => client.complete(request).await,
                    None => Err(LlmError::NotConfigured),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;

    #[tokio::test]
    async fn test_critical_uses_primary_only() {
        let primary = Arc::new(ScriptedLlmClient::new().with_default("primary"));
        let secondary = Arc::new(ScriptedLlmClient::new().with_default("secondary"));
        let router = LlmRouter::new(
            Some(primary.clone() as Arc<dyn LlmClient>),
            Some(secondary.clone() as Arc<dyn LlmClient>),
        );

        let resp = router
            .complete(TaskCriticality::Critical, &LlmRequest::new("x"))
            .await
            .unwrap();
        assert_eq!(resp.content, "primary");
        assert_eq!(secondary.calls().len(), 0);
    }

    #[tokio::test]
    async fn test_non_critical_falls_back_to_primary() {
        let primary = Arc::new(ScriptedLlmClient::new().with_default("primary"));
        let secondary = Arc::new(ScriptedLlmClient::new());
        secondary.push_error(LlmError::ServiceUnavailable("down".into()));
        let router = LlmRouter::new(
            Some(primary as Arc<dyn LlmClient>),
            Some(secondary as Arc<dyn LlmClient>),
        );

        let resp = router
            .complete(TaskCriticality::NonCritical, &LlmRequest::new("x"))
            .await
            .unwrap();
        assert_eq!(resp.content, "primary");
    }

    #[tokio::test]
    async fn test_disabled_router() {
        let router = LlmRouter::disabled();
        let err = router
            .complete(TaskCriticality::NonCritical, &LlmRequest::new("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::NotConfigured));
    }
}
