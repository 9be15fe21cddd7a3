use bytes::Bytes;
use std::collections::{HashMap, VecDeque};

/// How the task scheduler picks among eligible engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulerScheme {
    /// Rotate through engines in order.
    #[default]
    RoundRobin,
    /// Fewest outstanding tasks first; ties go to the earliest engine.
    LeastLoad,
}

/// Engine selection with a per-engine high-water mark.
pub struct LoadBalancer {
    engines: VecDeque<Bytes>,
    loads: HashMap<Bytes, usize>,
    /// Outstanding tasks allowed per engine; 0 means unlimited.
    hwm: usize,
    scheme: SchedulerScheme,
}

impl LoadBalancer {
    pub fn new(scheme: SchedulerScheme, hwm: usize) -> Self {
        Self {
            engines: VecDeque::new(),
            loads: HashMap::new(),
            hwm,
            scheme,
        }
    }

    /// Add an engine to the pool
    pub fn add_engine(&mut self, engine: Bytes) {
        if !self.loads.contains_key(&engine) {
            self.loads.insert(engine.clone(), 0);
            self.engines.push_back(engine);
        }
    }

    /// Remove an engine from the pool
    pub fn remove_engine(&mut self, engine: &[u8]) {
        self.engines.retain(|e| e.as_ref() != engine);
        self.loads.remove(engine);
    }

    pub fn contains(&self, engine: &[u8]) -> bool {
        self.loads.contains_key(engine)
    }

    pub fn engine_count(&self) -> usize {
        self.engines.len()
    }

    pub fn engines(&self) -> Vec<Bytes> {
        self.engines.iter().cloned().collect()
    }

    pub fn load(&self, engine: &[u8]) -> usize {
        self.loads.get(engine).copied().unwrap_or(0)
    }

    pub fn has_capacity(&self, engine: &[u8]) -> bool {
        self.hwm == 0 || self.load(engine) < self.hwm
    }

    /// Picks the next engine that passes `eligible` and is under the
    /// high-water mark.
    pub fn next_engine<F>(&mut self, eligible: F) -> Option<Bytes>
    where
        F: Fn(&Bytes) -> bool,
    {
        match self.scheme {
            SchedulerScheme::RoundRobin => {
                let pos = self
                    .engines
                    .iter()
                    .position(|e| eligible(e) && self.has_capacity(e))?;
                // Rotate: move the chosen engine to the back
                let engine = self.engines.remove(pos)?;
                self.engines.push_back(engine.clone());
                Some(engine)
            }
            SchedulerScheme::LeastLoad => self
                .engines
                .iter()
                .filter(|e| eligible(e) && self.has_capacity(e))
                .min_by_key(|e| self.load(e))
                .cloned(),
        }
    }

    pub fn add_load(&mut self, engine: &[u8]) {
        if let Some(load) = self.loads.get_mut(engine) {
            *load += 1;
        }
    }

    pub fn release(&mut self, engine: &[u8]) {
        if let Some(load) = self.loads.get_mut(engine) {
            *load = load.saturating_sub(1);
        }
    }
}
