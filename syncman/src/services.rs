//! Service registry: the sorted membership list of gateway nodes.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub addr: String,
}

impl Service {
    pub fn new(id: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            addr: addr.into(),
        }
    }

    /// Ordinal suffix of a StatefulSet-style id (`gateway-3` -> 3).
    pub fn ordinal(&self) -> Option<u64> {
        self.id.rsplit('-').next()?.parse().ok()
    }
}

/// Membership list, always sorted by `id` so every node derives the same
/// index for the same membership.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScServices(Vec<Service>);

impl ScServices {
    pub fn new(services: impl IntoIterator<Item = Service>) -> Self {
        let mut s = Self(services.into_iter().collect());
        s.sort();
        s
    }

    fn sort(&mut self) {
        // Stable so duplicate ids keep arrival order.
        self.0.sort_by(|a, b| a.id.cmp(&b.id));
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Service> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[Service] {
        &self.0
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.0.iter().position(|s| s.id == id)
    }

    pub fn get(&self, id: &str) -> Option<&Service> {
        self.0.iter().find(|s| s.id == id)
    }

    pub fn at(&self, index: usize) -> Option<&Service> {
        self.0.get(index)
    }

    /// Insert a service or update the address of an existing one.
    ///
    /// Returns true when the registry changed.
    pub fn upsert(&mut self, service: Service) -> bool {
        match self.0.iter_mut().find(|s| s.id == service.id) {
            Some(existing) if existing.addr == service.addr => false,
            Some(existing) => {
                existing.addr = service.addr;
                true
            }
            None => {
                self.0.push(service);
                self.sort();
                true
            }
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<Service> {
        let idx = self.index_of(id)?;
        Some(self.0.remove(idx))
    }

    /// The node allowed to act on cluster-wide commands: the lowest ordinal,
    /// falling back to the first entry of the sorted list.
    pub fn leader(&self) -> Option<&Service> {
        self.0
            .iter()
            .filter_map(|s| s.ordinal().map(|o| (o, s)))
            .min_by_key(|(o, _)| *o)
            .map(|(_, s)| s)
            .or_else(|| self.0.first())
    }
}

impl IntoIterator for ScServices {
    type Item = Service;
    type IntoIter = std::vec::IntoIter<Service>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a ScServices {
    type Item = &'a Service;
    type IntoIter = std::slice::Iter<'a, Service>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl FromIterator<Service> for ScServices {
    fn from_iter<I: IntoIterator<Item = Service>>(iter: I) -> Self {
        Self::new(iter)
    }
}
