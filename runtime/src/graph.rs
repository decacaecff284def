use std::{collections::BTreeMap, fmt, sync::Arc};

use crate::{
    error::{PipeError, Result},
    value::{Kwargs, Value},
};

pub type NodeId = usize;

/// A function executed inside the driver process.
pub type LocalFn = Arc<dyn Fn(Vec<Value>, Kwargs) -> anyhow::Result<Value> + Send + Sync>;

/// Where a graph node runs.
#[derive(Clone)]
pub enum Target {
    /// Invocation of the named stage, wherever it lives.
    Stage(String),
    /// Element `index` of the node's single argument. Extracted by the owner
    /// of the argument when it is a deferred reference.
    GetItem(usize),
    /// A function executed in the driver on resolved arguments.
    Local { name: String, f: LocalFn },
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Stage(name) => write!(f, "Stage({name})"),
            Target::GetItem(index) => write!(f, "GetItem({index})"),
            Target::Local { name, .. } => write!(f, "Local({name})"),
        }
    }
}

/// The source of a node argument.
#[derive(Debug, Clone)]
pub enum Arg {
    /// Positional input of the graph.
    Input(usize),
    /// The output of an earlier node.
    Node(NodeId),
    Const(Value),
}

#[derive(Debug, Clone)]
pub struct Node {
    pub target: Target,
    pub args: Vec<Arg>,
    pub kwargs: BTreeMap<String, Arg>,
}

impl Node {
    fn sources(&self) -> impl Iterator<Item = &Arg> {
        self.args.iter().chain(self.kwargs.values())
    }
}

/// A topologically ordered graph of stage invocations and local steps.
///
/// Nodes can only consume inputs and nodes added before them, so insertion
/// order is a valid execution order.
#[derive(Debug, Clone)]
pub struct StageGraph {
    inputs: usize,
    nodes: Vec<Node>,
    output: Option<Arg>,
}

impl StageGraph {
    /// Creates an empty graph taking `inputs` positional inputs.
    pub fn new(inputs: usize) -> Self {
        Self {
            inputs,
            nodes: Vec::new(),
            output: None,
        }
    }

    pub fn inputs(&self) -> usize {
        self.inputs
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn output(&self) -> Option<&Arg> {
        self.output.as_ref()
    }

    /// Appends a node and returns its id.
    pub fn push(&mut self, target: Target, args: Vec<Arg>, kwargs: BTreeMap<String, Arg>) -> NodeId {
        self.nodes.push(Node {
            target,
            args,
            kwargs,
        });
        self.nodes.len() - 1
    }

    /// Appends an invocation of stage `name`.
    pub fn stage(&mut self, name: impl Into<String>, args: Vec<Arg>) -> NodeId {
        self.push(Target::Stage(name.into()), args, BTreeMap::new())
    }

    pub fn stage_with_kwargs(
        &mut self,
        name: impl Into<String>,
        args: Vec<Arg>,
        kwargs: BTreeMap<String, Arg>,
    ) -> NodeId {
        self.push(Target::Stage(name.into()), args, kwargs)
    }

    /// Appends the extraction of element `index` out of `source`'s output.
    pub fn get_item(&mut self, source: NodeId, index: usize) -> NodeId {
        self.push(Target::GetItem(index), vec![Arg::Node(source)], BTreeMap::new())
    }

    /// Appends a step executed by the driver itself.
    pub fn local<F>(&mut self, name: impl Into<String>, args: Vec<Arg>, f: F) -> NodeId
    where
        F: Fn(Vec<Value>, Kwargs) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let target = Target::Local {
            name: name.into(),
            f: Arc::new(f),
        };
        self.push(target, args, BTreeMap::new())
    }

    pub fn set_output(&mut self, output: Arg) {
        self.output = Some(output);
    }

    /// Names of every stage the graph invokes, without duplicates.
    pub fn stage_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        for node in &self.nodes {
            if let Target::Stage(name) = &node.target {
                if !names.contains(&name.as_str()) {
                    names.push(name.as_str());
                }
            }
        }
        names
    }

    /// Checks the graph and computes the order in which the driver walks it.
    ///
    /// # Returns
    /// The schedule, `Config` on dangling or forward edges and
    /// `UnsupportedOutput` when the output cannot be a deferred reference.
    pub fn schedule(&self) -> Result<Schedule> {
        for (id, node) in self.nodes.iter().enumerate() {
            for arg in node.sources() {
                self.check_arg(id, arg)?;
            }
            if let Target::GetItem(_) = node.target {
                if node.args.len() != 1 {
                    return Err(PipeError::Config(format!(
                        "node {id} takes a single argument, got {}",
                        node.args.len()
                    )));
                }
            }
        }

        let output = match &self.output {
            None => return Err(PipeError::Config("graph has no output".into())),
            Some(Arg::Node(id)) if *id < self.nodes.len() => *id,
            Some(Arg::Node(id)) => {
                return Err(PipeError::Config(format!("output node {id} does not exist")));
            }
            Some(_) => return Err(PipeError::UnsupportedOutput { microbatch: 0 }),
        };
        if !self.yields_reference(output) {
            return Err(PipeError::UnsupportedOutput { microbatch: 0 });
        }

        let mut live = vec![false; self.nodes.len()];
        live[output] = true;
        for id in (0..=output).rev() {
            if !live[id] {
                continue;
            }
            for arg in self.nodes[id].sources() {
                if let Arg::Node(dep) = arg {
                    live[*dep] = true;
                }
            }
        }

        let order: Vec<NodeId> = (0..self.nodes.len()).filter(|&id| live[id]).collect();

        let mut last_use = vec![None; self.nodes.len()];
        for (step, &id) in order.iter().enumerate() {
            for arg in self.nodes[id].sources() {
                if let Arg::Node(dep) = arg {
                    last_use[*dep] = Some(step);
                }
            }
        }

        let mut drops = vec![Vec::new(); order.len()];
        for (id, step) in last_use.into_iter().enumerate() {
            if let Some(step) = step {
                if id != output {
                    drops[step].push(id);
                }
            }
        }

        Ok(Schedule {
            order,
            drops,
            output,
        })
    }

    /// Whether node `id` evaluates to a deferred reference for every microbatch.
    fn yields_reference(&self, id: NodeId) -> bool {
        let node = &self.nodes[id];
        match node.target {
            Target::Stage(_) => true,
            Target::Local { .. } => false,
            Target::GetItem(_) => match node.args.first() {
                Some(Arg::Node(source)) => self.yields_reference(*source),
                _ => false,
            },
        }
    }

    fn check_arg(&self, id: NodeId, arg: &Arg) -> Result<()> {
        match arg {
            Arg::Input(i) if *i >= self.inputs => Err(PipeError::Config(format!(
                "node {id} reads input {i} of a graph with {} inputs",
                self.inputs
            ))),
            Arg::Node(dep) if *dep >= id => Err(PipeError::Config(format!(
                "node {id} depends on node {dep} which is not before it"
            ))),
            _ => Ok(()),
        }
    }
}

/// The live nodes of a graph in execution order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    order: Vec<NodeId>,
    drops: Vec<Vec<NodeId>>,
    output: NodeId,
}

impl Schedule {
    /// Nodes that reach the output, in topological order.
    pub fn order(&self) -> &[NodeId] {
        &self.order
    }

    /// Nodes whose value is no longer needed once step `step` ran.
    pub fn drops_after(&self, step: usize) -> &[NodeId] {
        &self.drops[step]
    }

    pub fn output(&self) -> NodeId {
        self.output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> StageGraph {
        let mut graph = StageGraph::new(1);
        let a = graph.stage("a", vec![Arg::Input(0)]);
        let b = graph.stage("b", vec![Arg::Node(a)]);
        let c = graph.stage("c", vec![Arg::Node(b), Arg::Node(a)]);
        graph.set_output(Arg::Node(c));
        graph
    }

    #[test]
    fn schedule_follows_insertion_order() {
        let schedule = chain().schedule().unwrap();

        assert_eq!(schedule.order(), &[0, 1, 2]);
        assert_eq!(schedule.output(), 2);
        assert!(schedule.drops_after(0).is_empty());
        assert!(schedule.drops_after(1).is_empty());
        assert_eq!(schedule.drops_after(2), &[0, 1]);
    }

    #[test]
    fn dead_nodes_are_pruned() {
        let mut graph = StageGraph::new(1);
        let a = graph.stage("a", vec![Arg::Input(0)]);
        let _unused = graph.stage("debug", vec![Arg::Node(a)]);
        let b = graph.stage("b", vec![Arg::Node(a)]);
        graph.set_output(Arg::Node(b));

        let schedule = graph.schedule().unwrap();
        assert_eq!(schedule.order(), &[0, 2]);
        assert_eq!(graph.stage_names(), vec!["a", "debug", "b"]);
    }

    #[test]
    fn forward_edges_are_rejected() {
        let mut graph = StageGraph::new(1);
        let a = graph.stage("a", vec![Arg::Node(1)]);
        graph.stage("b", vec![Arg::Input(0)]);
        graph.set_output(Arg::Node(a));

        assert!(matches!(graph.schedule(), Err(PipeError::Config(_))));
    }

    #[test]
    fn missing_inputs_are_rejected() {
        let mut graph = StageGraph::new(1);
        let a = graph.stage("a", vec![Arg::Input(1)]);
        graph.set_output(Arg::Node(a));

        assert!(matches!(graph.schedule(), Err(PipeError::Config(_))));
    }

    #[test]
    fn output_must_come_from_a_node() {
        let mut graph = StageGraph::new(1);
        graph.stage("a", vec![Arg::Input(0)]);
        assert!(matches!(graph.schedule(), Err(PipeError::Config(_))));

        graph.set_output(Arg::Input(0));
        assert!(matches!(
            graph.schedule(),
            Err(PipeError::UnsupportedOutput { .. })
        ));
    }

    #[test]
    fn outputs_that_never_hold_a_reference_are_rejected() {
        let mut graph = StageGraph::new(1);
        let a = graph.stage("a", vec![Arg::Input(0)]);
        let local = graph.local("sum", vec![Arg::Node(a)], |args, _| Ok(args[0].clone()));
        graph.set_output(Arg::Node(local));
        assert!(matches!(
            graph.schedule(),
            Err(PipeError::UnsupportedOutput { microbatch: 0 })
        ));

        let mut graph = StageGraph::new(1);
        let item = graph.push(Target::GetItem(0), vec![Arg::Input(0)], BTreeMap::new());
        let nested = graph.get_item(item, 1);
        graph.set_output(Arg::Node(nested));
        assert!(matches!(
            graph.schedule(),
            Err(PipeError::UnsupportedOutput { .. })
        ));

        // projections of a stage output stay references
        let mut graph = StageGraph::new(1);
        let a = graph.stage("a", vec![Arg::Input(0)]);
        let item = graph.get_item(a, 0);
        let nested = graph.get_item(item, 1);
        graph.set_output(Arg::Node(nested));
        assert_eq!(graph.schedule().unwrap().output(), nested);
    }
}
