use std::sync::Arc;

use regnet_core::{LightningImplementation, LightningNode};

use super::{CLightningService, EclairService, LightningService, LndService};
use crate::transport::HttpTransport;

/// Resolves the adapter for a node from its implementation tag.
#[derive(Clone)]
pub struct LightningFactory {
    lnd: Arc<dyn LightningService>,
    clightning: Arc<dyn LightningService>,
    eclair: Arc<dyn LightningService>,
}

impl std::fmt::Debug for LightningFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LightningFactory").finish_non_exhaustive()
    }
}

impl LightningFactory {
    /// Build the three stock adapters over one shared transport.
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            lnd: Arc::new(LndService::new(transport.clone())),
            clightning: Arc::new(CLightningService::new(transport.clone())),
            eclair: Arc::new(EclairService::new(transport)),
        }
    }

    /// Use custom adapters, one per implementation.
    pub fn from_services(
        lnd: Arc<dyn LightningService>,
        clightning: Arc<dyn LightningService>,
        eclair: Arc<dyn LightningService>,
    ) -> Self {
        Self {
            lnd,
            clightning,
            eclair,
        }
    }

    /// The adapter serving `node`.
    pub fn service(&self, node: &LightningNode) -> &dyn LightningService {
        self.for_implementation(node.implementation)
    }

    /// The adapter serving `implementation`.
    pub fn for_implementation(
        &self,
        implementation: LightningImplementation,
    ) -> &dyn LightningService {
        match implementation {
            LightningImplementation::Lnd => self.lnd.as_ref(),
            LightningImplementation::CLightning => self.clightning.as_ref(),
            LightningImplementation::Eclair => self.eclair.as_ref(),
        }
    }
}
