//! Tokens bearer de agentes y extractor para los handlers.

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use common::AgentId;

use crate::state::AppState;

/// Emite y valida tokens opacos con vida acotada. Reemitir para un agente
/// invalida sus tokens anteriores.
pub struct TokenStore {
    ttl: Duration,
    tokens: Mutex<HashMap<String, (AgentId, DateTime<Utc>)>>,
}

impl TokenStore {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            ttl: Duration::seconds(i64::try_from(ttl_secs).unwrap_or(i64::MAX).min(i64::MAX / 1000)),
            tokens: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl_secs(&self) -> u64 {
        self.ttl.num_seconds().max(0) as u64
    }

    fn tokens(&self) -> MutexGuard<'_, HashMap<String, (AgentId, DateTime<Utc>)>> {
        self.tokens.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn issue(&self, agent_id: &str) -> String {
        self.issue_at(agent_id, Utc::now())
    }

    fn issue_at(&self, agent_id: &str, now: DateTime<Utc>) -> String {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let mut tokens = self.tokens();
        tokens.retain(|_, (owner, expires)| owner != agent_id && *expires > now);
        tokens.insert(token.clone(), (agent_id.to_string(), now + self.ttl));
        debug!("token emitido para {}", agent_id);
        token
    }

    pub fn validate(&self, token: &str) -> Option<AgentId> {
        self.validate_at(token, Utc::now())
    }

    fn validate_at(&self, token: &str, now: DateTime<Utc>) -> Option<AgentId> {
        let mut tokens = self.tokens();
        match tokens.get(token) {
            Some((agent_id, expires)) if *expires > now => Some(agent_id.clone()),
            Some(_) => {
                tokens.remove(token);
                None
            }
            None => None,
        }
    }
}

/// Agente autenticado por su token bearer. Sin token válido responde 401.
pub struct AgentAuth(pub AgentId);

#[axum::async_trait]
impl FromRequestParts<AppState> for AgentAuth {
    type Rejection = StatusCode;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(StatusCode::UNAUTHORIZED)?;

        state
            .tokens
            .validate(token.trim())
            .map(AgentAuth)
            .ok_or(StatusCode::UNAUTHORIZED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_valido_hasta_que_vence() {
        let store = TokenStore::new(60);
        let now = Utc::now();
        let token = store.issue_at("a1", now);

        assert_eq!(store.validate_at(&token, now).as_deref(), Some("a1"));
        assert!(store
            .validate_at(&token, now + Duration::seconds(61))
            .is_none());
        // el token vencido ya no existe
        assert!(store.validate_at(&token, now).is_none());
    }

    #[test]
    fn reemitir_invalida_el_token_anterior() {
        let store = TokenStore::new(60);
        let old = store.issue("a1");
        let other = store.issue("a2");
        let new = store.issue("a1");

        assert!(store.validate(&old).is_none());
        assert_eq!(store.validate(&new).as_deref(), Some("a1"));
        assert_eq!(store.validate(&other).as_deref(), Some("a2"));
    }

    #[test]
    fn token_desconocido_no_valida() {
        let store = TokenStore::new(60);
        assert!(store.validate("nada").is_none());
        assert_eq!(store.ttl_secs(), 60);
    }
}
