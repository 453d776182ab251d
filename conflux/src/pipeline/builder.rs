//! Fluent pipeline assembly with build-time validation.

use super::graph::Pipeline;
use super::link::{CompletionJoin, Link, LinkOptions};
use crate::cancellation::CancellationScope;
use crate::channel::Channel;
use crate::errors::{ConfigValidationError, CycleDetectedError, FlowError};
use crate::stage::{Stage, StageControl};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Gray,
    Black,
}

/// Builds a [`Pipeline`] from stages and links.
///
/// Stages are added with [`PipelineBuilder::add_stage`], wired with
/// [`PipelineBuilder::link`], and hidden behind an ingress/egress channel
/// pair by [`PipelineBuilder::encapsulate`]. Links into the same target
/// channel share one [`CompletionJoin`], so fan-in targets complete only
/// once every contributing link has completed.
pub struct PipelineBuilder {
    name: String,
    stages: Vec<Arc<dyn StageControl>>,
    links: Vec<Link>,
    joins: HashMap<usize, Arc<dyn Any + Send + Sync>>,
    edges: Vec<(usize, usize, String)>,
    scope: Arc<CancellationScope>,
}

impl PipelineBuilder {
    /// Creates a new builder with a fresh root cancellation scope.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            links: Vec::new(),
            joins: HashMap::new(),
            edges: Vec::new(),
            scope: CancellationScope::new(),
        }
    }

    /// Uses `scope` instead of the builder's own root scope.
    #[must_use]
    pub fn with_scope(mut self, scope: Arc<CancellationScope>) -> Self {
        self.scope = scope;
        self
    }

    /// Adds a stage to the pipeline.
    #[must_use]
    pub fn add_stage<In, Out>(mut self, stage: Arc<Stage<In, Out>>) -> Self
    where
        In: Send + fmt::Debug + 'static,
        Out: Send + 'static,
    {
        self.edges.push((
            channel_key(&stage.input()),
            channel_key(&stage.output()),
            stage.name().to_string(),
        ));
        self.stages.push(stage);
        self
    }

    /// Wires `source` into `target` with the given propagation flags. The
    /// pump starts immediately; items only flow once something writes to
    /// `source`.
    #[must_use]
    pub fn link<T: Send + 'static>(
        mut self,
        source: &Arc<Channel<T>>,
        target: &Arc<Channel<T>>,
        options: LinkOptions,
    ) -> Self {
        let join = self.join_for(target);
        let label = format!("link-{}", self.links.len());
        self.edges
            .push((channel_key(source), channel_key(target), label.clone()));
        self.links
            .push(Link::spawn(label, source.clone(), target.clone(), options, join));
        self
    }

    /// Validates the topology and exposes it behind the given ingress and
    /// egress channels.
    ///
    /// Fails with a [`ConfigValidationError`] for an empty pipeline and a
    /// [`CycleDetectedError`] for a cyclic topology. Every stage is
    /// registered with the pipeline's cancellation scope.
    pub fn encapsulate<In, Out>(
        self,
        ingress: &Arc<Channel<In>>,
        egress: &Arc<Channel<Out>>,
    ) -> Result<Pipeline<In, Out>, FlowError> {
        if self.stages.is_empty() {
            return Err(ConfigValidationError::new(
                "pipeline requires at least one stage",
            )
            .into());
        }
        self.detect_cycle()?;
        for stage in &self.stages {
            self.scope.register(stage.clone());
        }
        Ok(Pipeline::new(
            self.name,
            self.stages,
            self.links,
            ingress.clone(),
            egress.clone(),
            self.scope,
        ))
    }

    fn join_for<T: Send + 'static>(&mut self, target: &Arc<Channel<T>>) -> Arc<CompletionJoin<T>> {
        let key = channel_key(target);
        if let Some(existing) = self.joins.get(&key) {
            if let Ok(join) = existing.clone().downcast::<CompletionJoin<T>>() {
                return join;
            }
        }
        let join = Arc::new(CompletionJoin::new(target.clone()));
        self.joins
            .insert(key, join.clone() as Arc<dyn Any + Send + Sync>);
        join
    }

    fn detect_cycle(&self) -> Result<(), FlowError> {
        let mut adjacency: HashMap<usize, Vec<(usize, &str)>> = HashMap::new();
        for (from, to, label) in &self.edges {
            adjacency.entry(*from).or_default().push((*to, label.as_str()));
        }
        let mut marks: HashMap<usize, Mark> = HashMap::new();
        let mut trail = Vec::new();
        for node in adjacency.keys() {
            if !marks.contains_key(node) {
                visit(*node, &adjacency, &mut marks, &mut trail)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("name", &self.name)
            .field("stages", &self.stages.len())
            .field("links", &self.links.len())
            .finish()
    }
}

fn channel_key<T>(channel: &Arc<Channel<T>>) -> usize {
    Arc::as_ptr(channel) as usize
}

fn visit(
    node: usize,
    adjacency: &HashMap<usize, Vec<(usize, &str)>>,
    marks: &mut HashMap<usize, Mark>,
    trail: &mut Vec<String>,
) -> Result<(), FlowError> {
    marks.insert(node, Mark::Gray);
    for (next, label) in adjacency.get(&node).into_iter().flatten() {
        match marks.get(next) {
            Some(Mark::Gray) => {
                let mut path = trail.clone();
                path.push((*label).to_string());
                return Err(CycleDetectedError::new(path).into());
            }
            Some(Mark::Black) => {}
            None => {
                trail.push((*label).to_string());
                visit(*next, adjacency, marks, trail)?;
                trail.pop();
            }
        }
    }
    marks.insert(node, Mark::Black);
    Ok(())
}
