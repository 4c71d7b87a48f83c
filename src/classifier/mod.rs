//! Address classification
//!
//! Registry first, then on-chain metadata. Resolved answers are cached
//! process-wide; failed lookups are returned as unresolved and retried on
//! the next request.

pub mod registry;

pub use registry::{AddressRegistry, RegistryEntry};

use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::ProvenanceCache;
use crate::source::ChainDataSource;
use crate::types::{AddressMeta, AddressNode, Chain, Classification};

/// Classifies addresses as exchange, bridge, protocol or wallet
pub struct AddressClassifier {
    registry: Arc<AddressRegistry>,
    source: Arc<dyn ChainDataSource>,
    cache: Arc<ProvenanceCache>,
}

impl AddressClassifier {
    pub fn new(
        registry: Arc<AddressRegistry>,
        source: Arc<dyn ChainDataSource>,
        cache: Arc<ProvenanceCache>,
    ) -> Self {
        Self {
            registry,
            source,
            cache,
        }
    }

    pub fn registry(&self) -> &AddressRegistry {
        &self.registry
    }

    /// Classify `address` on `chain`. Never fails: a metadata error yields
    /// an `Unknown` node with `resolved == false`.
    pub async fn classify(&self, address: &str, chain: Chain) -> AddressNode {
        let address = chain.normalize_address(address);

        if let Some(node) = self.cache.get_classification(chain, &address) {
            return node;
        }

        if let Some(entry) = self.registry.lookup(chain, &address) {
            let node = AddressNode {
                address,
                chain,
                classification: entry.classification,
                label: Some(entry.label.clone()),
                resolved: true,
            };
            self.cache.set_classification(&node);
            return node;
        }

        if chain != self.source.chain() {
            warn!(
                address = %address,
                chain = %chain,
                source_chain = %self.source.chain(),
                "No metadata source for chain"
            );
            return unresolved(address, chain);
        }

        match self.source.get_address_meta(&address).await {
            Ok(meta) => {
                let node = self.from_meta(address, chain, &meta);
                debug!(
                    address = %node.address,
                    classification = %node.classification,
                    "Classified from metadata"
                );
                self.cache.set_classification(&node);
                node
            }
            Err(e) => {
                warn!(address = %address, error = %e, "Metadata lookup failed");
                unresolved(address, chain)
            }
        }
    }

    fn from_meta(&self, address: String, chain: Chain, meta: &AddressMeta) -> AddressNode {
        let owned_by_token_program = meta
            .program_owner
            .as_deref()
            .map(|owner| self.registry.is_token_program(owner))
            .unwrap_or(false);

        let (classification, label) = if meta.is_contract && owned_by_token_program {
            (Classification::Unknown, Some("token account".to_string()))
        } else if meta.is_contract {
            (Classification::Eoa, Some("contract".to_string()))
        } else {
            (Classification::Eoa, None)
        };

        AddressNode {
            address,
            chain,
            classification,
            label,
            resolved: true,
        }
    }
}

fn unresolved(address: String, chain: Chain) -> AddressNode {
    AddressNode {
        address,
        chain,
        classification: Classification::Unknown,
        label: None,
        resolved: false,
    }
}
