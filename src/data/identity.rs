use super::ingestion::{Observation, Protocol};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info};

const ID_PREFIX_LEN: usize = 5;

/// Manual `market_id -> canonical label` table for markets that upstream labels
/// identically although they are economically distinct.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelOverrides(pub HashMap<String, String>);

impl LabelOverrides {
    /// Known Morpho Blue WETH/wstETH 94.5% variants sharing one upstream label.
    pub fn known() -> Self {
        Self(HashMap::from([
            (
                "0xc54d7acf14de29e0e5527cabd7a576506870346a78a11a6762e2cca66322ec41".to_string(),
                "WETH / wstETH (94.5) MP".to_string(),
            ),
            (
                "0xd0e50cdac92fe2172043f5e0c36532c6369d24947e40968f34a5e8819ca9ec5d".to_string(),
                "WETH / wstETH (94.5) ER".to_string(),
            ),
        ]))
    }

    pub fn get(&self, market_id: &str) -> Option<&str> {
        self.0.get(market_id).map(String::as_str)
    }
}

/// Identity of a market within one resolution pass.
///
/// Protocols without a native key are identified by their raw label.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum MarketKey {
    Native(String),
    Labelled(Protocol, String),
}

impl MarketKey {
    fn of(observation: &Observation) -> Self {
        match &observation.market_id {
            Some(id) if !id.is_empty() => MarketKey::Native(id.clone()),
            _ => MarketKey::Labelled(observation.protocol, observation.market.clone()),
        }
    }
}

/// Restores label uniqueness across all protocols' observations.
pub struct IdentityResolver {
    overrides: LabelOverrides,
}

impl IdentityResolver {
    pub fn new(overrides: LabelOverrides) -> Self {
        Self { overrides }
    }

    /// Rewrites every observation's `market` to its final label.
    ///
    /// After the override table is applied, labels shared by more than one market get a
    /// market id prefix appended (5 characters, longer if two ids share a prefix).
    /// Labels used by exactly one market are left untouched. The result maps distinct
    /// markets to distinct labels.
    pub fn resolve(&self, mut observations: Vec<Observation>) -> Vec<Observation> {
        for observation in observations.iter_mut() {
            if let Some(canonical) = observation
                .market_id
                .as_deref()
                .and_then(|id| self.overrides.get(id))
            {
                observation.market = canonical.to_string();
            }
        }

        let mut markets_by_label: BTreeMap<String, BTreeSet<MarketKey>> = BTreeMap::new();
        for observation in &observations {
            markets_by_label
                .entry(observation.market.clone())
                .or_default()
                .insert(MarketKey::of(observation));
        }

        let mut renamed: HashMap<(String, MarketKey), String> = HashMap::new();
        for (label, keys) in &markets_by_label {
            if keys.len() < 2 {
                continue;
            }
            debug!(%label, markets = keys.len(), "disambiguating shared label");
            for (key, suffix) in disambiguating_suffixes(keys) {
                renamed.insert((label.clone(), key), format!("{} {}", label, suffix));
            }
        }

        if renamed.is_empty() {
            return observations;
        }
        info!(labels = renamed.len(), "renamed colliding market labels");

        for observation in observations.iter_mut() {
            let key = (observation.market.clone(), MarketKey::of(observation));
            if let Some(label) = renamed.get(&key) {
                observation.market = label.clone();
            }
        }

        observations
    }
}

/// Shortest id prefix (at least 5 characters) that tells the keys of one label apart.
fn disambiguating_suffixes(keys: &BTreeSet<MarketKey>) -> Vec<(MarketKey, String)> {
    let ids: Vec<&str> = keys
        .iter()
        .filter_map(|key| match key {
            MarketKey::Native(id) => Some(id.as_str()),
            MarketKey::Labelled(..) => None,
        })
        .collect();
    let longest = ids.iter().map(|id| id.chars().count()).max().unwrap_or(0);

    let mut len = ID_PREFIX_LEN;
    while len < longest {
        let prefixes: BTreeSet<String> = ids.iter().map(|id| prefix(id, len)).collect();
        if prefixes.len() == ids.len() {
            break;
        }
        len += 1;
    }

    keys.iter()
        .map(|key| {
            let suffix = match key {
                MarketKey::Native(id) => prefix(id, len),
                MarketKey::Labelled(protocol, _) => protocol.to_string(),
            };
            (key.clone(), suffix)
        })
        .collect()
}

fn prefix(id: &str, len: usize) -> String {
    id.chars().take(len).collect()
}
