//! Flow composition.
//!
//! A [`FlowNode`] tree is first flattened into a [`FlowTree`] arena, then
//! lowered in one pass to the broker's nested [`FlowJob`] format. Every node
//! is validated and resolved before anything is submitted.

use serde_json::Value;

use jobline_models::{FlowJob, JobOptions, NewJob};

use crate::definition::JobDefinition;
use crate::error::{JobsError, JobsResult, SchemaViolation};
use crate::schema::{self, Payload};

/// One job of a flow: a registered job, its payload, per-node options and
/// the children that must complete before it runs.
#[derive(Debug)]
pub struct FlowNode {
    job_id: String,
    data: Result<Value, SchemaViolation>,
    options: JobOptions,
    children: Vec<FlowNode>,
}

impl FlowNode {
    pub fn new<T: Payload, D>(definition: &JobDefinition<T, D>, payload: &T) -> Self {
        Self {
            job_id: definition.id().to_string(),
            data: schema::encode(payload),
            options: JobOptions::default(),
            children: Vec::new(),
        }
    }

    /// Node for a job known only by ID, with an untyped payload.
    pub fn from_json(job_id: impl Into<String>, data: Value) -> Self {
        Self {
            job_id: job_id.into(),
            data: Ok(data),
            options: JobOptions::default(),
            children: Vec::new(),
        }
    }

    /// Override the definition's options for this node only.
    pub fn options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    pub fn child(mut self, child: FlowNode) -> Self {
        self.children.push(child);
        self
    }

    pub fn children(mut self, children: impl IntoIterator<Item = FlowNode>) -> Self {
        self.children.extend(children);
        self
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }
}

#[derive(Debug)]
struct ArenaNode {
    job_id: String,
    data: Result<Value, SchemaViolation>,
    options: JobOptions,
    /// Arena index of the parent: 0 is the root, `i` is `descendants[i - 1]`
    parent: usize,
}

/// Flattened flow: the root plus its descendants in pre-order.
#[derive(Debug)]
pub(crate) struct FlowTree {
    root: ArenaNode,
    descendants: Vec<ArenaNode>,
}

fn flatten(node: FlowNode, parent: usize, out: &mut Vec<ArenaNode>) {
    let FlowNode {
        job_id,
        data,
        options,
        children,
    } = node;
    out.push(ArenaNode {
        job_id,
        data,
        options,
        parent,
    });
    let index = out.len();
    for child in children {
        flatten(child, index, out);
    }
}

fn lower_node<F>(node: ArenaNode, prepare: &mut F) -> JobsResult<FlowJob>
where
    F: FnMut(&str, &Value, &JobOptions) -> JobsResult<(NewJob, String)>,
{
    let data = node
        .data
        .map_err(|violation| JobsError::validation(&node.job_id, violation))?;
    let (job, queue) = prepare(&node.job_id, &data, &node.options)?;

    Ok(FlowJob {
        name: job.name,
        queue_name: queue,
        data: job.data,
        opts: job.opts,
        children: Vec::new(),
    })
}

impl FlowTree {
    pub(crate) fn build(root: FlowNode) -> Self {
        let FlowNode {
            job_id,
            data,
            options,
            children,
        } = root;

        let mut descendants = Vec::new();
        for child in children {
            flatten(child, 0, &mut descendants);
        }

        Self {
            root: ArenaNode {
                job_id,
                data,
                options,
                parent: 0,
            },
            descendants,
        }
    }

    pub(crate) fn len(&self) -> usize {
        1 + self.descendants.len()
    }

    /// Lower to the wire format. `prepare` validates one node and returns
    /// its enqueue request and queue name.
    pub(crate) fn lower<F>(self, mut prepare: F) -> JobsResult<FlowJob>
    where
        F: FnMut(&str, &Value, &JobOptions) -> JobsResult<(NewJob, String)>,
    {
        let mut root = lower_node(self.root, &mut prepare)?;

        let mut parents = Vec::with_capacity(self.descendants.len());
        let mut lowered = Vec::with_capacity(self.descendants.len());
        for node in self.descendants {
            parents.push(node.parent);
            lowered.push(lower_node(node, &mut prepare)?);
        }

        // Pre-order puts every child after its parent, so popping from the
        // back always yields a complete subtree.
        while let Some(job) = lowered.pop() {
            match parents[lowered.len()] {
                0 => root.children.insert(0, job),
                parent => lowered[parent - 1].children.insert(0, job),
            }
        }
        Ok(root)
    }
}
