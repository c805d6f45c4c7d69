//! Application state shared across request handlers.

use std::sync::Arc;

use crate::providers::{ProviderContext, Providers};
use crate::registration::Registrar;
use crate::registry::Registry;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    ctx: Arc<ProviderContext>,
    providers: Arc<Providers>,
    registrar: Registrar,
}

impl AppState {
    pub fn new(ctx: Arc<ProviderContext>, providers: Arc<Providers>) -> Self {
        let registrar = Registrar::new(ctx.clone(), providers.clone());
        Self {
            inner: Arc::new(AppStateInner {
                ctx,
                providers,
                registrar,
            }),
        }
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        self.inner.ctx.registry()
    }

    pub fn ctx(&self) -> &Arc<ProviderContext> {
        &self.inner.ctx
    }

    pub fn providers(&self) -> &Arc<Providers> {
        &self.inner.providers
    }

    pub fn registrar(&self) -> &Registrar {
        &self.inner.registrar
    }
}
