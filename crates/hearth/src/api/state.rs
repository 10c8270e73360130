//! Application state shared across handlers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::auth::AuthState;
use crate::chat::ChatRepository;
use crate::db::Database;
use crate::llm::{ModelInvoker, ModelRegistry};
use crate::quota::QuotaGuard;
use crate::settings::AppConfig;
use crate::turn::{ActiveGenerations, StreamRelay, TurnReconciler};
use crate::user::{LockoutPolicy, UserRepository, UserService};

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub auth: AuthState,
    pub users: UserService,
    pub chats: ChatRepository,
    pub quota: QuotaGuard,
    pub registry: Arc<ModelRegistry>,
    pub reconciler: TurnReconciler,
    pub relay: StreamRelay,
    pub active: ActiveGenerations,
    pub keep_alive: Duration,
}

impl AppState {
    /// Wire every service over one database and model invoker.
    pub fn new(config: &AppConfig, db: Database, invoker: ModelInvoker) -> Result<Self> {
        config.validate().context("invalid configuration")?;
        let registry = Arc::new(
            ModelRegistry::new(config.models.clone(), &config.default_model)
                .context("building model registry")?,
        );
        for model in registry.models() {
            if !invoker.has_provider(&model.provider) {
                anyhow::bail!(
                    "model {:?} uses provider {:?}, which is not configured",
                    model.id,
                    model.provider
                );
            }
        }

        let pool = db.pool().clone();
        let user_repo = UserRepository::new(pool.clone());
        let users = UserService::new(
            user_repo.clone(),
            LockoutPolicy {
                threshold: config.auth.lockout_threshold,
                window_minutes: config.auth.lockout_minutes,
            },
        );
        let auth = AuthState::new(config.auth.clone(), user_repo);
        let chats = ChatRepository::new(pool.clone());
        let quota = QuotaGuard::new(pool, config.quota);
        let active = ActiveGenerations::new();

        let reconciler = TurnReconciler::new(chats.clone(), quota.clone(), registry.clone());
        let relay = StreamRelay::new(
            chats.clone(),
            quota.clone(),
            Arc::new(invoker),
            registry.clone(),
            active.clone(),
            Duration::from_secs(config.generation.max_duration_secs),
        );

        Ok(Self {
            db,
            auth,
            users,
            chats,
            quota,
            registry,
            reconciler,
            relay,
            active,
            keep_alive: Duration::from_secs(config.generation.keep_alive_secs),
        })
    }
}
