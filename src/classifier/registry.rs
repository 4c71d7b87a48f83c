//! Known-address registry
//!
//! Static tables of exchange hot wallets, bridges and DeFi programs, keyed
//! per chain. A registry is a plain value: build it with `with_defaults()`,
//! layer deployment overrides with `merge`, and hand it to the classifier.

use std::collections::{HashMap, HashSet};

use crate::types::{Chain, Classification};

/// Token-2022 program id
pub const TOKEN_2022_PROGRAM: &str = "TokenzQdBNbLqP5VEhdkAS6EPFLC1PHnBqCXEpPxuEb";

/// EVM exchange hot wallets (lowercase)
const EVM_CEX: &[(&str, &str)] = &[
    ("0x28c6c06298d514db089934071355e5743bf21d60", "Binance 14"),
    ("0x21a31ee1afc51d94c2efccaa2092ad1028285549", "Binance 15"),
    ("0xf89d7b9c864f589bbf53a82105107622b35eaa40", "Binance 16"),
    ("0xf977814e90da44bfa03b6295a0616a897441acec", "Binance 8"),
    ("0x56eddb7aa87536c09ccc2793473599fd21a8b17f", "Coinbase 4"),
    ("0xa9d1e08c7793af67e9d92fe308d5697fb81d3e43", "Coinbase 10"),
    ("0x71660c4005ba85c37ccec55d0c4493e66fe775d3", "Coinbase 3"),
    ("0x0d0707963952f2fba59dd06f2b425ace40b492fe", "Gate.io"),
    ("0x6262998ced04146fa42253a5c0af90ca02dfd2a3", "Crypto.com 1"),
    ("0x46340b20830761efd32832a74d7169b29feb9758", "Crypto.com 2"),
    ("0xfbb1b73c4f0bda4f67dca266ce6ef42f520fbb98", "Bitget"),
    ("0x5f65f7b609678448494de4c87521cdf6cef1e932", "OKX"),
    ("0x3c783c21a0383057d128bae431894a5c19f9cf06", "Bybit"),
];

const EVM_BRIDGES: &[(&str, &str)] = &[
    ("0x40ec5b33f54e0e8a33a975908c5ba1c14e5bbbdf", "Polygon Bridge"),
    ("0x5a58505a96d1dbf8df91cb21b54419fc36e93fde", "Wormhole Bridge"),
];

const SOLANA_CEX: &[(&str, &str)] = &[
    ("9WzDXwBbmkg8ZTbNMqUxvQRAyrZzDsGYdLVL9zYtAWWM", "Binance"),
    ("5tzFkiKscXHK5ZXCGbXZxdw7gTjjD1mBwuoFbhUvuAi9", "Binance"),
    ("2ojv9BAiHUrvsm9gxDe7fJSzbNZSJcxZvf8dqmWGHG8S", "Binance"),
    ("AC5RDfQFmDS1deWZos921JfqscXdByf8BKHs5ACWjtW2", "Coinbase"),
    ("GJRs4FwHtemZ5ZE9x3FNvJ8TMwitKTh21yxdRPqn7npE", "Coinbase Prime"),
    ("H8sMJSCQxfKiFTCfDR3DUMLPwcRbM61LGFJ8N4dK3WjS", "FTX (defunct)"),
    ("CuieVDEDtLo7FypA9SbLM9saXFdb1dsshEkyErMqkRQq", "Kraken"),
    ("FWznbcNXWQuHTawe9RxvQ2LdCENssh12dsznf4RiouN5", "Kraken"),
    ("ASTyfSima4LLAdDgoFGkgqoKowG1LZFDr9fAQrg7iaJZ", "OKX"),
    ("5VCwKtCXgCJ6kit5FybXjvriW3xELsFDhYrPSqtJNmcD", "Gate.io"),
];

const SOLANA_DEFI: &[(&str, &str)] = &[
    ("9xQeWvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFin", "Serum DEX"),
    ("whirLbMiicVdio4qvUfM5KAg6Ct8VwpYzGff3uctyCc", "Orca Whirlpool"),
    ("CAMMCzo5YL8w4VFF8KVHrK22GGUsp5VTaW7grrKgrWqK", "Raydium CLMM"),
    ("675kPX9MHTjS2zt1qfr1NYHuzeLXfQM9H24wFSUt1Mp8", "Raydium AMM"),
    ("JUP6LkbZbjS1jKKwapdHNy74zcZ3tLUZoi5QNyVTaV4", "Jupiter"),
    ("MERLuDFBMmsHnsBPZw2sDQZHvXFMwp8EdjudcU2HKky", "Mercurial"),
];

const SOLANA_BRIDGES: &[(&str, &str)] = &[
    ("wormDTUJ6AWPNvk59vGQbDvGJmqbDTdgWgAqcLBCgUb", "Wormhole Token Bridge"),
    ("3u8hJUVTA4jH1wYAyUur7FFZVQ8H635K3tSHHF4ssjQ5", "Allbridge Core"),
    ("br1xwubggTiEZ6b7iNZUwfA3psygFfaXGfZ1heaN9AW", "Allbridge"),
];

/// One registry row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub classification: Classification,
    pub label: String,
}

/// Per-chain table of known addresses plus the token-program ids
#[derive(Debug, Clone, Default)]
pub struct AddressRegistry {
    entries: HashMap<Chain, HashMap<String, RegistryEntry>>,
    token_programs: HashSet<String>,
}

impl AddressRegistry {
    /// Registry with no entries
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry holding the built-in tables
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();

        for chain in [Chain::Ethereum, Chain::Polygon] {
            registry.extend(chain, Classification::Cex, EVM_CEX);
            registry.extend(chain, Classification::Bridge, EVM_BRIDGES);
        }

        registry.extend(Chain::Solana, Classification::Cex, SOLANA_CEX);
        registry.extend(Chain::Solana, Classification::DefiProtocol, SOLANA_DEFI);
        registry.extend(Chain::Solana, Classification::Bridge, SOLANA_BRIDGES);

        registry.add_token_program(&spl_token::id().to_string());
        registry.add_token_program(TOKEN_2022_PROGRAM);
        registry
    }

    fn extend(&mut self, chain: Chain, classification: Classification, rows: &[(&str, &str)]) {
        for (address, label) in rows {
            self.insert(chain, address, classification, label);
        }
    }

    /// Add or replace an entry
    pub fn insert(
        &mut self,
        chain: Chain,
        address: &str,
        classification: Classification,
        label: &str,
    ) {
        self.entries.entry(chain).or_default().insert(
            chain.normalize_address(address),
            RegistryEntry {
                classification,
                label: label.to_string(),
            },
        );
    }

    pub fn add_token_program(&mut self, program_id: &str) {
        self.token_programs.insert(program_id.trim().to_string());
    }

    /// Layer `overrides` on top; its entries win
    pub fn merge(mut self, overrides: AddressRegistry) -> Self {
        for (chain, rows) in overrides.entries {
            self.entries.entry(chain).or_default().extend(rows);
        }
        self.token_programs.extend(overrides.token_programs);
        self
    }

    /// Exact match on the normalized address
    pub fn lookup(&self, chain: Chain, address: &str) -> Option<&RegistryEntry> {
        self.entries
            .get(&chain)?
            .get(&chain.normalize_address(address))
    }

    pub fn is_token_program(&self, owner: &str) -> bool {
        self.token_programs.contains(owner)
    }

    /// Number of entries for `chain`
    pub fn len(&self, chain: Chain) -> usize {
        self.entries.get(&chain).map(HashMap::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.values().all(HashMap::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_lookup() {
        let registry = AddressRegistry::with_defaults();

        // EVM lookups ignore checksum casing
        let hit = registry
            .lookup(Chain::Polygon, "0x28C6c06298d514Db089934071355E5743bf21d60")
            .unwrap();
        assert_eq!(hit.classification, Classification::Cex);
        assert_eq!(hit.label, "Binance 14");

        let bridge = registry
            .lookup(Chain::Polygon, "0x40ec5b33f54e0e8a33a975908c5ba1c14e5bbbdf")
            .unwrap();
        assert_eq!(bridge.classification, Classification::Bridge);

        let jup = registry
            .lookup(Chain::Solana, "JUP6LkbZbjS1jKKwapdHNy74zcZ3tLUZoi5QNyVTaV4")
            .unwrap();
        assert_eq!(jup.classification, Classification::DefiProtocol);

        // Solana is case-sensitive
        assert!(registry
            .lookup(Chain::Solana, "jup6lkbzbjs1jkkwapdhny74zcz3tluzoi5qnyvtav4")
            .is_none());
        assert!(registry.is_token_program("TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA"));
        assert!(registry.is_token_program(TOKEN_2022_PROGRAM));
    }

    #[test]
    fn test_merge_overrides_win() {
        let mut overrides = AddressRegistry::empty();
        overrides.insert(
            Chain::Polygon,
            "0x28c6c06298d514db089934071355e5743bf21d60",
            Classification::Eoa,
            "relabelled",
        );
        overrides.insert(Chain::Base, "0x1111111111111111111111111111111111111111", Classification::Cex, "Exchange1");

        let registry = AddressRegistry::with_defaults().merge(overrides);
        let hit = registry
            .lookup(Chain::Polygon, "0x28c6c06298d514db089934071355e5743bf21d60")
            .unwrap();
        assert_eq!(hit.label, "relabelled");
        assert_eq!(registry.len(Chain::Base), 1);
        assert_eq!(registry.len(Chain::Polygon), EVM_CEX.len() + EVM_BRIDGES.len());
    }

    #[test]
    fn test_empty() {
        let registry = AddressRegistry::empty();
        assert!(registry.is_empty());
        assert!(registry.lookup(Chain::Ethereum, "0xabc").is_none());
        assert!(!registry.is_token_program("TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA"));
    }
}
