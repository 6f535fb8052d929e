//! Test data builders for creating flows over an in-memory store

use pipeflow::operation::Count;
use pipeflow::pipe::{GroupBy, PipeAssembly};
use pipeflow::tap::{MemoryStore, Scheme, SinkMode, TapRef};
use pipeflow::tuple::Fields;
use pipeflow::{Flow, FlowDef, PlannerError};

/// Binds pipe names to taps in a shared [`MemoryStore`].
pub struct FlowBuilder {
    store: MemoryStore,
    name: Option<String>,
    sources: Vec<(String, TapRef)>,
    sinks: Vec<(String, TapRef)>,
    traps: Vec<(String, TapRef)>,
}

impl FlowBuilder {
    pub fn new(store: &MemoryStore) -> Self {
        Self {
            store: store.clone(),
            name: None,
            sources: Vec::new(),
            sinks: Vec::new(),
            traps: Vec::new(),
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn source(mut self, pipe: &str, identifier: &str, fields: impl Into<Fields>) -> Self {
        let tap = self.store.tap(identifier, Scheme::new(fields.into()));
        self.sources.push((pipe.to_string(), tap));
        self
    }

    pub fn source_tap(mut self, pipe: &str, tap: TapRef) -> Self {
        self.sources.push((pipe.to_string(), tap));
        self
    }

    pub fn sink(mut self, pipe: &str, identifier: &str) -> Self {
        let tap = self.store.tap(identifier, Scheme::default());
        self.sinks.push((pipe.to_string(), tap));
        self
    }

    pub fn sink_with(mut self, pipe: &str, identifier: &str, scheme: Scheme, mode: SinkMode) -> Self {
        let tap = pipeflow::tap::MemoryTap::new(&self.store, identifier, scheme).with_sink_mode(mode);
        self.sinks.push((pipe.to_string(), std::sync::Arc::new(tap)));
        self
    }

    pub fn trap(mut self, pipe: &str, identifier: &str) -> Self {
        let tap = self.store.tap(identifier, Scheme::default());
        self.traps.push((pipe.to_string(), tap));
        self
    }

    pub fn def(self, assembly: PipeAssembly) -> FlowDef {
        let mut def = FlowDef::new(assembly);
        if let Some(name) = self.name {
            def = def.named(name);
        }
        for (pipe, tap) in self.sources {
            def = def.source(pipe, tap);
        }
        for (pipe, tap) in self.sinks {
            def = def.sink(pipe, tap);
        }
        for (pipe, tap) in self.traps {
            def = def.trap(pipe, tap);
        }
        def
    }

    pub fn connect(self, assembly: PipeAssembly) -> Result<Flow, PlannerError> {
        super::connector().connect(self.def(assembly))
    }
}

/// `head` grouped on `field` and counted.
pub fn count_by(head: &str, field: &str) -> PipeAssembly {
    let mut assembly = PipeAssembly::new();
    let pipe = assembly.head(head);
    let group = assembly.group_by(GroupBy::new(pipe, field));
    assembly.every_aggregator(group, Fields::all(), Count::new(), Fields::all());
    assembly
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_builder() {
        let store = MemoryStore::new();
        let flow = FlowBuilder::new(&store)
            .named("built")
            .source("words", "in", "word")
            .sink("words", "out")
            .connect(count_by("words", "word"))
            .unwrap();

        assert_eq!(flow.name(), "built");
        assert_eq!(flow.sources()["words"].identifier(), "in");
        assert_eq!(flow.sinks()["words"].identifier(), "out");
    }
}
