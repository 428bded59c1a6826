//! Round fee pricing.

use std::sync::Arc;

use bitcoin::Network;

use crate::ChainSource;

/// Confirmation target used to price rounds.
const CONF_TARGET: u16 = 6;

/// Supplies the sat/vB rate a round is priced at.
///
/// Primary source is the node's `estimatesmartfee`; when the node has no
/// estimate (or the call fails) the configured fallback rate applies.
/// Regtest never asks the node, since fee estimation needs chain
/// history a fresh regtest cannot have.
pub struct FeeOracle {
    chain: Arc<dyn ChainSource>,
    fallback_rate: u64,
    regtest: bool,
}

impl FeeOracle {
    pub fn new(chain: Arc<dyn ChainSource>, fallback_rate: u64, network: Network) -> Self {
        FeeOracle {
            chain,
            fallback_rate,
            regtest: network == Network::Regtest,
        }
    }

    /// Current fee rate in sat/vB. Infallible: falls back rather than
    /// blocking round creation.
    pub async fn fee_rate(&self) -> u64 {
        if self.regtest {
            return self.fallback_rate;
        }

        match self.chain.estimate_smart_fee(CONF_TARGET).await {
            Ok(Some(rate)) if rate > 0 => rate,
            Ok(_) => {
                log::warn!(
                    "Node returned no fee estimate, using fallback {} sat/vB",
                    self.fallback_rate
                );
                self.fallback_rate
            }
            Err(e) => {
                log::warn!(
                    "Fee estimation failed ({}), using fallback {} sat/vB",
                    e,
                    self.fallback_rate
                );
                self.fallback_rate
            }
        }
    }
}
