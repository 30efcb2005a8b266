//! The execution engine
//!
//! Drives a [`CompiledGraph`] from `START` to `END` one *step* at a time. A
//! step executes one compiled node (a synthesized fan-out region counts as a
//! single step), merges its update through the key-strategy registry, and,
//! when a checkpoint store is attached, persists the merged state. Step N+1
//! never begins before step N's merge and checkpoint have both committed; a
//! failing step commits nothing, so a re-invocation under the same thread
//! continues from the last committed checkpoint.
//!
//! # Step protocol
//!
//! ```text
//!   ┌─────────────────────────────────────────────────────────────┐
//!   │ 1. cancellation check                                       │
//!   │ 2. execute node action(s)        (retry policy, if any)     │
//!   │ 3. interrupt hook                (Simple nodes only)        │
//!   │      └─ Some(metadata) ────────▶ suspend, update withheld   │
//!   │ 4. merge update(s) into state    (declaration order)        │
//!   │ 5. checkpoint                    (store + thread, if any)   │
//!   │ 6. resolve next node             (direct edge or router)    │
//!   └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Entry points
//!
//! - [`invoke`](CompiledGraph::invoke) /
//!   [`invoke_with_config`](CompiledGraph::invoke_with_config) - run to
//!   completion, return the final state. Suspension is an error here.
//! - [`run`](CompiledGraph::run) - full protocol: returns a [`RunOutcome`]
//!   that is either the final state or a suspension to feed back into.
//! - [`stream`](CompiledGraph::stream) /
//!   [`stream_with_config`](CompiledGraph::stream_with_config) - one
//!   [`NodeOutput`] per committed step.
//!
//! # Parallel regions
//!
//! Branches of a fan-out region run concurrently as spawned tasks, each
//! branch sequentially. Every branch starts from the state as of region
//! entry; collected updates merge in branch *declaration order*, never
//! completion order, so parallel runs are deterministic. The whole region
//! commits atomically: one merge batch, one checkpoint.
//!
//! # Resumption
//!
//! With a store attached and a `thread_id` in the config, a run first loads
//! the thread's checkpoint (the most recent, or the one named by
//! `checkpoint_id`) and continues from the checkpointed node's successor;
//! the caller's input is ignored in favor of the checkpointed state. If the
//! checkpoint holds a pending interruption, feedback is read from the
//! config metadata: valid feedback commits the withheld update and the run
//! continues, anything else leaves the run suspended without error.
//!
//! # Example
//!
//! ```rust
//! use flowgraph_core::{MemoryCheckpointStore, RunConfig, StateGraph, ReplaceStrategy, START, END};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let mut graph = StateGraph::new();
//! graph
//!     .register_key("count", ReplaceStrategy)
//!     .add_node("increment", |state| {
//!         Box::pin(async move {
//!             let count = state["count"].as_i64().unwrap_or(0);
//!             Ok(json!({"count": count + 1}))
//!         })
//!     })
//!     .add_edge(START, "increment")
//!     .add_edge("increment", END);
//!
//! let compiled = graph
//!     .compile()?
//!     .with_checkpoint_store(Arc::new(MemoryCheckpointStore::new()));
//!
//! let result = compiled
//!     .invoke_with_config(json!({"count": 0}), RunConfig::new("session-1"))
//!     .await?;
//! assert_eq!(result["count"], 1);
//! # Ok(())
//! # }
//! ```

use crate::compile::{BranchChain, CompiledGraph, NodeKind};
use crate::error::{GraphError, Result};
use crate::graph::{Edge, NodeAction, NodeId, END, START};
use crate::interrupt::{
    apply_feedback, FeedbackItem, InterruptionMetadata, PendingInterruption, FEEDBACK_KEY,
    INTERRUPTION_KEY, INTERRUPTION_STATE_KEY,
};
use crate::retry::RetryPolicy;
use crate::strategy::KeyStrategyRegistry;
use async_stream::try_stream;
use flowgraph_checkpoint::{Checkpoint, CheckpointError, RunConfig};
use futures::Stream;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

/// How a run ended
#[derive(Debug)]
pub enum RunOutcome {
    /// The graph reached `END`; the final merged state
    Completed(Value),

    /// An interrupt hook paused the run before a step committed
    Suspended {
        /// State as of the suspension, carrying the pending record under
        /// the reserved `__interruption__` key; pass it back as input to
        /// resume without a store
        state: Value,
        /// What the run is waiting on
        interruption: InterruptionMetadata,
        /// Config annotated with the suspension (and its checkpoint, when
        /// a store is attached)
        config: RunConfig,
    },
}

/// One committed step as observed through [`CompiledGraph::stream`]
#[derive(Debug, Clone, PartialEq)]
pub struct NodeOutput {
    /// The executed node; a synthesized region id for fan-outs
    pub node: NodeId,

    /// Full merged state after the step committed
    pub state: Value,
}

/// Stream of committed steps, ending after the step entering `END`
pub type NodeStream<'a> = Pin<Box<dyn Stream<Item = Result<NodeOutput>> + Send + 'a>>;

/// Where a prepared run starts from
enum Prepared {
    Run {
        state: Value,
        next: NodeId,
        /// Node whose withheld update just committed via feedback
        resumed: Option<NodeId>,
        config: RunConfig,
    },
    /// Still waiting: feedback was missing, partial, or mismatched
    Hold {
        state: Value,
        interruption: InterruptionMetadata,
        config: RunConfig,
    },
}

/// Result of executing one node
enum StepResult {
    Committed {
        state: Value,
        next: NodeId,
        config: RunConfig,
    },
    Hold {
        state: Value,
        interruption: InterruptionMetadata,
        config: RunConfig,
    },
}

impl CompiledGraph {
    /// Run the graph to completion and return the final state.
    ///
    /// Equivalent to [`invoke_with_config`](Self::invoke_with_config) with a
    /// default (threadless) config.
    pub async fn invoke(&self, input: Value) -> Result<Value> {
        self.invoke_with_config(input, RunConfig::default()).await
    }

    /// Run the graph to completion under a config.
    ///
    /// A suspension surfaces as [`GraphError::Suspended`]; use
    /// [`run`](Self::run) for graphs with interruptible nodes.
    pub async fn invoke_with_config(&self, input: Value, config: RunConfig) -> Result<Value> {
        match self.run(input, config).await? {
            RunOutcome::Completed(state) => Ok(state),
            RunOutcome::Suspended { interruption, .. } => Err(GraphError::Suspended {
                node: interruption.node,
            }),
        }
    }

    /// Run the graph until it completes or suspends.
    #[tracing::instrument(
        skip_all,
        fields(thread = config.thread_id.as_deref().unwrap_or("-"))
    )]
    pub async fn run(&self, input: Value, config: RunConfig) -> Result<RunOutcome> {
        let (mut state, mut current, mut config) = match self.prepare(input, config).await? {
            Prepared::Run {
                state,
                next,
                config,
                ..
            } => (state, next, config),
            Prepared::Hold {
                state,
                interruption,
                config,
            } => {
                return Ok(RunOutcome::Suspended {
                    state,
                    interruption,
                    config,
                })
            }
        };

        let mut steps = 0usize;
        while current != END {
            steps += 1;
            if steps > self.recursion_limit {
                return Err(GraphError::RecursionLimit {
                    limit: self.recursion_limit,
                });
            }
            check_cancelled(&self.cancellation)?;

            match self.step(&current, state, config).await? {
                StepResult::Committed {
                    state: committed,
                    next,
                    config: updated,
                } => {
                    state = committed;
                    config = updated;
                    current = next;
                }
                StepResult::Hold {
                    state,
                    interruption,
                    config,
                } => {
                    return Ok(RunOutcome::Suspended {
                        state,
                        interruption,
                        config,
                    })
                }
            }
        }
        tracing::debug!(steps, "run completed");
        Ok(RunOutcome::Completed(state))
    }

    /// Stream committed steps with a default (threadless) config.
    pub fn stream(&self, input: Value) -> NodeStream<'_> {
        self.stream_with_config(input, RunConfig::default())
    }

    /// Stream one [`NodeOutput`] per committed step.
    ///
    /// The stream ends after the step entering `END`. A suspension ends the
    /// stream with [`GraphError::Suspended`]; a resumed run first yields the
    /// step committed by the feedback.
    pub fn stream_with_config(&self, input: Value, config: RunConfig) -> NodeStream<'_> {
        Box::pin(try_stream! {
            match self.prepare(input, config).await? {
                Prepared::Hold { interruption, .. } => {
                    let suspended: Result<()> = Err(GraphError::Suspended {
                        node: interruption.node,
                    });
                    suspended?;
                }
                Prepared::Run { state, next, resumed, config } => {
                    if let Some(node) = resumed {
                        yield NodeOutput { node, state: state.clone() };
                    }
                    let mut state = state;
                    let mut current = next;
                    let mut config = config;
                    let mut steps = 0usize;
                    while current != END {
                        steps += 1;
                        if steps > self.recursion_limit {
                            let exceeded: Result<()> = Err(GraphError::RecursionLimit {
                                limit: self.recursion_limit,
                            });
                            exceeded?;
                        }
                        check_cancelled(&self.cancellation)?;

                        match self.step(&current, state, config).await? {
                            StepResult::Committed { state: committed, next, config: updated } => {
                                yield NodeOutput {
                                    node: current.clone(),
                                    state: committed.clone(),
                                };
                                state = committed;
                                config = updated;
                                current = next;
                            }
                            StepResult::Hold { interruption, .. } => {
                                let suspended: Result<()> = Err(GraphError::Suspended {
                                    node: interruption.node,
                                });
                                suspended?;
                                break;
                            }
                        }
                    }
                }
            }
        })
    }

    /// Load checkpointed state and settle any pending interruption before
    /// the first step.
    async fn prepare(&self, input: Value, mut config: RunConfig) -> Result<Prepared> {
        let mut state = input;
        let mut resume_node: Option<NodeId> = None;
        if let (Some(store), Some(thread)) = (&self.store, config.thread_id.clone()) {
            if let Some(checkpoint) = store.get(&thread, config.checkpoint_id.as_deref()).await? {
                tracing::debug!(thread = %thread, checkpoint = %checkpoint.id, "resuming from checkpoint");
                state = checkpoint.state;
                resume_node = checkpoint.node;
            }
        }

        let pending = match state.get(INTERRUPTION_STATE_KEY) {
            Some(record) => Some(
                serde_json::from_value::<PendingInterruption>(record.clone())
                    .map_err(CheckpointError::from)?,
            ),
            None => None,
        };
        let Some(pending) = pending else {
            let next = match &resume_node {
                Some(node) => self.next_from(node, &state)?,
                None => self.next_from(START, &state)?,
            };
            return Ok(Prepared::Run {
                state,
                next,
                resumed: None,
                config,
            });
        };

        let feedback = config
            .metadata(FEEDBACK_KEY)
            .and_then(|value| serde_json::from_value::<Vec<FeedbackItem>>(value.clone()).ok())
            .unwrap_or_default();

        if !pending.metadata().accepts(&feedback) {
            let interruption = pending.metadata();
            config.set_metadata(
                INTERRUPTION_KEY,
                serde_json::to_value(&interruption).map_err(CheckpointError::from)?,
            );
            tracing::debug!(node = %interruption.node, "feedback missing or mismatched, staying suspended");
            return Ok(Prepared::Hold {
                state,
                interruption,
                config,
            });
        }

        // Valid feedback: rewrite and commit the withheld update, then
        // continue from the interrupted node's successor.
        if let Some(map) = state.as_object_mut() {
            map.remove(INTERRUPTION_STATE_KEY);
        }
        config.metadata.remove(FEEDBACK_KEY);
        config.metadata.remove(INTERRUPTION_KEY);
        let node = pending.node.clone();
        let update = apply_feedback(pending.update, &feedback);
        let state = self.registry.apply(state, update)?;
        let config = self.maybe_persist(&state, &node, config).await?;
        let next = self.next_from(&node, &state)?;
        tracing::info!(node = %node, "resumed with feedback");
        Ok(Prepared::Run {
            state,
            next,
            resumed: Some(node),
            config,
        })
    }

    /// Execute one compiled node and commit (or withhold) its effects.
    async fn step(&self, current: &str, state: Value, config: RunConfig) -> Result<StepResult> {
        let node = self.nodes.get(current).ok_or_else(|| GraphError::MissingNode {
            node: current.to_string(),
        })?;

        match &node.kind {
            NodeKind::Simple { action, interrupt } => {
                let update = run_action(current, action, &state, self.retry.as_ref()).await?;
                if let Some(hook) = interrupt {
                    if let Some(metadata) = hook(current, &update, &config) {
                        return self.suspend(state, metadata, update, config).await;
                    }
                }
                let state = self.registry.apply(state, update)?;
                let config = self.maybe_persist(&state, current, config).await?;
                let next = self.next_from(current, &state)?;
                Ok(StepResult::Committed {
                    state,
                    next,
                    config,
                })
            }
            NodeKind::ParallelJoin { branches, .. } => {
                let state = self.run_parallel(current, branches, state).await?;
                let config = self.maybe_persist(&state, current, config).await?;
                let next = self.next_from(current, &state)?;
                Ok(StepResult::Committed {
                    state,
                    next,
                    config,
                })
            }
            NodeKind::SubGraph { graph, .. } => {
                let state = self.run_parallel(current, &graph.branches, state).await?;
                let config = self.maybe_persist(&state, current, config).await?;
                let next = self.next_from(current, &state)?;
                Ok(StepResult::Committed {
                    state,
                    next,
                    config,
                })
            }
        }
    }

    /// Run a fan-out region's branches concurrently and merge their updates
    /// in declaration order.
    async fn run_parallel(
        &self,
        region: &str,
        branches: &[BranchChain],
        state: Value,
    ) -> Result<Value> {
        let ctx = RegionContext {
            registry: self.registry.clone(),
            retry: self.retry,
            cancellation: self.cancellation.clone(),
        };
        let collecting = run_region(ctx, branches.to_vec(), state.clone());
        let updates = match &self.cancellation {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => return Err(GraphError::Cancelled),
                collected = collecting => collected?,
            },
            None => collecting.await?,
        };

        let mut state = state;
        for (node, update) in updates {
            tracing::trace!(region, node = %node, "merging branch update");
            state = self.registry.apply(state, update)?;
        }
        Ok(state)
    }

    /// Withhold a node's update and hand the caller an interruption.
    async fn suspend(
        &self,
        state: Value,
        metadata: InterruptionMetadata,
        update: Value,
        mut config: RunConfig,
    ) -> Result<StepResult> {
        let pending = PendingInterruption::new(metadata.clone(), update);
        let record = serde_json::to_value(&pending).map_err(CheckpointError::from)?;
        let mut state = state;
        match state.as_object_mut() {
            Some(map) => {
                map.insert(INTERRUPTION_STATE_KEY.to_string(), record);
            }
            None => {
                return Err(GraphError::invalid(format!(
                    "state must be a JSON object, got {state}"
                )))
            }
        }
        config = self.maybe_persist(&state, &metadata.node, config).await?;
        config.set_metadata(
            INTERRUPTION_KEY,
            serde_json::to_value(&metadata).map_err(CheckpointError::from)?,
        );
        tracing::info!(
            node = %metadata.node,
            items = metadata.items.len(),
            "run suspended awaiting feedback"
        );
        Ok(StepResult::Hold {
            state,
            interruption: metadata,
            config,
        })
    }

    /// Checkpoint the merged state when a store and thread are configured.
    async fn maybe_persist(&self, state: &Value, node: &str, mut config: RunConfig) -> Result<RunConfig> {
        let (Some(store), Some(thread)) = (&self.store, config.thread_id.clone()) else {
            return Ok(config);
        };
        let checkpoint = Checkpoint::new(state.clone()).with_node(node);
        let stored = store.put(&thread, None, checkpoint).await?;
        if let Some(id) = stored.checkpoint_id {
            config.checkpoint_id = Some(id);
        }
        Ok(config)
    }

    /// Resolve the node following `node` given the committed state.
    fn next_from(&self, node: &str, state: &Value) -> Result<NodeId> {
        match self.edges_from(node) {
            Some([Edge::Direct(to)]) => Ok(to.clone()),
            Some([Edge::Conditional { router, targets }]) => {
                let label = router(state);
                targets.get(&label).cloned().ok_or_else(|| {
                    GraphError::UnknownRouteTarget {
                        node: node.to_string(),
                        label,
                    }
                })
            }
            _ => Err(GraphError::MissingNode {
                node: node.to_string(),
            }),
        }
    }
}

/// What a spawned branch task needs from the graph
#[derive(Clone)]
struct RegionContext {
    registry: KeyStrategyRegistry,
    retry: Option<RetryPolicy>,
    cancellation: Option<CancellationToken>,
}

fn check_cancelled(token: &Option<CancellationToken>) -> Result<()> {
    match token {
        Some(token) if token.is_cancelled() => Err(GraphError::Cancelled),
        _ => Ok(()),
    }
}

/// Execute one action, retrying per the policy before giving up.
async fn run_action(
    node: &str,
    action: &NodeAction,
    state: &Value,
    retry: Option<&RetryPolicy>,
) -> Result<Value> {
    let max_attempts = retry.map_or(1, |policy| policy.max_attempts.max(1));
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match action(state.clone()).await {
            Ok(update) => return Ok(update),
            Err(source) if attempt >= max_attempts => {
                return Err(GraphError::node_execution(node, source));
            }
            Err(source) => {
                let delay = retry.map(|policy| policy.delay_for(attempt)).unwrap_or_default();
                tracing::warn!(node, attempt, error = %source, "node action failed, retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Run every branch of a region concurrently; collected updates come back
/// in branch declaration order, each branch's own updates in step order.
///
/// Boxed so branch chains containing nested regions can recurse through it.
fn run_region(
    ctx: RegionContext,
    branches: Vec<BranchChain>,
    entry_state: Value,
) -> Pin<Box<dyn Future<Output = Result<Vec<(NodeId, Value)>>> + Send>> {
    Box::pin(async move {
        let mut handles = Vec::with_capacity(branches.len());
        for chain in branches {
            handles.push(tokio::spawn(run_chain(
                ctx.clone(),
                chain,
                entry_state.clone(),
            )));
        }
        let mut collected = Vec::new();
        for handle in handles {
            let updates = handle
                .await
                .map_err(|err| GraphError::invalid(format!("parallel branch task failed: {err}")))??;
            collected.extend(updates);
        }
        Ok(collected)
    })
}

/// Run one branch sequentially against a private copy of the entry state.
///
/// Later steps of the branch observe earlier steps' updates; the returned
/// list carries each update exactly once for the region-level merge.
async fn run_chain(
    ctx: RegionContext,
    chain: BranchChain,
    mut state: Value,
) -> Result<Vec<(NodeId, Value)>> {
    let mut collected = Vec::new();
    for step in chain.steps {
        check_cancelled(&ctx.cancellation)?;
        match step.kind {
            NodeKind::Simple { action, .. } => {
                let update = run_action(&step.id, &action, &state, ctx.retry.as_ref()).await?;
                state = ctx.registry.apply(state, update.clone())?;
                collected.push((step.id, update));
            }
            NodeKind::ParallelJoin { branches, .. } => {
                let updates = run_region(ctx.clone(), branches, state.clone()).await?;
                for (node, update) in updates {
                    state = ctx.registry.apply(state, update.clone())?;
                    collected.push((node, update));
                }
            }
            NodeKind::SubGraph { graph, .. } => {
                let updates = run_region(ctx.clone(), graph.branches, state.clone()).await?;
                for (node, update) in updates {
                    state = ctx.registry.apply(state, update.clone())?;
                    collected.push((node, update));
                }
            }
        }
    }
    Ok(collected)
}
