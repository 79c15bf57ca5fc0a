use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Load snapshot of one host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeLoad {
    pub host: String,
    pub running_jobs: usize,
    pub current_load: f32,
    pub max_load: f32,
}

impl NodeLoad {
    pub fn idle(host: impl Into<String>, max_load: f32) -> Self {
        Self {
            host: host.into(),
            running_jobs: 0,
            current_load: 0.0,
            max_load,
        }
    }

    pub fn load_factor(&self) -> f32 {
        ratio(self.current_load, self.max_load)
    }

    /// Load factor after adding a job of the given weight.
    pub fn projected_load_factor(&self, job_load: f32) -> f32 {
        ratio(self.current_load + job_load, self.max_load)
    }
}

fn ratio(load: f32, max_load: f32) -> f32 {
    if max_load > 0.0 {
        load / max_load
    } else {
        f32::INFINITY
    }
}

/// Per-host load, keyed by host URL. Derived from the job store on demand.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemLoad {
    nodes: BTreeMap<String, NodeLoad>,
}

impl SystemLoad {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, load: NodeLoad) {
        self.nodes.insert(load.host.clone(), load);
    }

    pub fn get(&self, host: &str) -> Option<&NodeLoad> {
        self.nodes.get(host)
    }

    /// Current load sum of a host, zero when the host has no entry.
    pub fn current_load(&self, host: &str) -> f32 {
        self.nodes.get(host).map(|n| n.current_load).unwrap_or(0.0)
    }

    /// Account for a job just bound to `host`.
    pub fn assign(&mut self, host: &str, job_load: f32) {
        if let Some(node) = self.nodes.get_mut(host) {
            node.running_jobs += 1;
            node.current_load += job_load;
        }
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeLoad> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl FromIterator<NodeLoad> for SystemLoad {
    fn from_iter<T: IntoIterator<Item = NodeLoad>>(iter: T) -> Self {
        let mut load = SystemLoad::new();
        for node in iter {
            load.insert(node);
        }
        load
    }
}
