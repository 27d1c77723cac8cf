//! FlowProducer: atomically adds a tree of parent/child jobs, possibly
//! spanning multiple queues.

use crate::error::{JobError, JobResult};
use crate::events::{Event, EventSink, NullEventSink};
use crate::job::{now_ms, resolve_kind_and_score, Job, JobOptions, ParentRef};
use crate::scripts::Scripts;
use deadpool_redis::Pool;
use std::sync::Arc;

/// Default cap on flow nesting depth, guarding against a pathological or
/// accidentally cyclic flow description turning into an unbounded stack.
pub const DEFAULT_MAX_DEPTH: usize = 32;

/// One node of a flow description, as supplied by the caller before any ids
/// are assigned.
#[derive(Debug, Clone)]
pub struct FlowJob {
    pub name: String,
    pub queue_name: String,
    pub data: serde_json::Value,
    pub opts: JobOptions,
    pub prefix: Option<String>,
    pub children: Vec<FlowJob>,
}

impl FlowJob {
    pub fn new(name: impl Into<String>, queue_name: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            queue_name: queue_name.into(),
            data,
            opts: JobOptions::default(),
            prefix: None,
            children: Vec::new(),
        }
    }

    pub fn with_opts(mut self, opts: JobOptions) -> Self {
        self.opts = opts;
        self
    }

    pub fn with_children(mut self, children: Vec<FlowJob>) -> Self {
        self.children = children;
        self
    }
}

/// One node of the constructed tree, returned once every job in the flow
/// has been durably written.
#[derive(Debug, Clone)]
pub struct FlowNode {
    pub job: Job,
    pub queue_name: String,
    pub children: Vec<FlowNode>,
}

/// Adds whole job trees atomically: every child's dependency entry exists
/// before the child itself is ever observable, and a parent only becomes
/// eligible to run once every child has resolved.
pub struct FlowProducer {
    pool: Pool,
    default_prefix: String,
    max_depth: usize,
    sink: Arc<dyn EventSink>,
}

struct StackFrame {
    spec: FlowJob,
    depth: usize,
    parent_slot: Option<usize>,
}

struct BuiltSlot {
    job: Job,
    queue_name: String,
    children: Vec<usize>,
}

impl FlowProducer {
    pub fn new(pool: Pool, default_prefix: impl Into<String>) -> Self {
        Self {
            pool,
            default_prefix: default_prefix.into(),
            max_depth: DEFAULT_MAX_DEPTH,
            sink: Arc::new(NullEventSink),
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Adds one flow tree, depth-first, under an explicit stack (not native
    /// recursion) so depth is bounded by a check rather than the call stack.
    pub async fn add(&self, flow: FlowJob) -> JobResult<FlowNode> {
        let mut conn = self.pool.get().await?;
        let mut slots: Vec<BuiltSlot> = Vec::new();
        let mut stack = vec![StackFrame {
            spec: flow,
            depth: 0,
            parent_slot: None,
        }];

        while let Some(frame) = stack.pop() {
            if frame.depth > self.max_depth {
                return Err(JobError::InvalidArgument(format!(
                    "flow depth exceeds the maximum of {}",
                    self.max_depth
                )));
            }

            let prefix = frame
                .spec
                .prefix
                .clone()
                .unwrap_or_else(|| self.default_prefix.clone());
            let scripts = Scripts::new(&prefix, &frame.spec.queue_name);

            let mut opts = frame.spec.opts.clone();
            if let Some(parent_slot) = frame.parent_slot {
                opts.parent = Some(ParentRef {
                    id: slots[parent_slot].job.id.clone(),
                    queue: format!("{}:{}", prefix, slots[parent_slot].queue_name),
                });
            }

            let has_children = !frame.spec.children.is_empty();
            let mut job = Job::new(frame.spec.name.clone(), frame.spec.data.clone(), opts)?;

            let id = if has_children {
                scripts.add_parent_job(&mut *conn, &job, now_ms()).await?
            } else {
                let (kind, score) = resolve_kind_and_score(&job.opts);
                scripts.add_job(&mut *conn, &job, kind, score, now_ms()).await?
            };
            job.id = id;
            self.sink.emit(Event::Added {
                job_id: job.id.clone(),
                name: job.name.clone(),
            });

            let slot = slots.len();
            slots.push(BuiltSlot {
                job,
                queue_name: frame.spec.queue_name.clone(),
                children: Vec::new(),
            });
            if let Some(parent_slot) = frame.parent_slot {
                slots[parent_slot].children.push(slot);
            }

            for child in frame.spec.children.into_iter().rev() {
                stack.push(StackFrame {
                    spec: child,
                    depth: frame.depth + 1,
                    parent_slot: Some(slot),
                });
            }
        }

        Ok(build_tree(&mut slots, 0))
    }

    /// Adds several independent flow trees, sequentially over one connection.
    pub async fn add_bulk(&self, flows: Vec<FlowJob>) -> JobResult<Vec<FlowNode>> {
        let mut results = Vec::with_capacity(flows.len());
        for flow in flows {
            results.push(self.add(flow).await?);
        }
        Ok(results)
    }
}

/// Reconstructs the nested result tree from the flat, insertion-ordered
/// slot list built during the iterative walk. Recursion here is bounded by
/// `max_depth` and operates on already-fetched data, not the store.
fn build_tree(slots: &mut [BuiltSlot], index: usize) -> FlowNode {
    let children_indices = std::mem::take(&mut slots[index].children);
    let children = children_indices
        .into_iter()
        .map(|child_index| build_tree(slots, child_index))
        .collect();
    FlowNode {
        job: slots[index].job.clone(),
        queue_name: slots[index].queue_name.clone(),
        children,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_job_builder_sets_children() {
        let flow = FlowJob::new("parent", "emails", serde_json::json!({}))
            .with_children(vec![FlowJob::new("child", "emails", serde_json::json!({}))]);
        assert_eq!(flow.children.len(), 1);
        assert_eq!(flow.children[0].name, "child");
    }

    #[test]
    fn default_max_depth_is_generous_but_bounded() {
        let pool_free_default = DEFAULT_MAX_DEPTH;
        assert!(pool_free_default >= 8);
    }
}
