use crate::error::SchedulerError;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VertexId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Min,
    Max,
    Sum,
}

impl Aggregate {
    /// Combines the input values. An aggregate without inputs is 0.
    fn combine(self, values: impl Iterator<Item = f64>) -> f64 {
        let folded = match self {
            Aggregate::Sum => Some(values.sum()),
            Aggregate::Min => values.reduce(f64::min),
            Aggregate::Max => values.reduce(f64::max),
        };
        folded.unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VertexKind {
    Input,
    Aggregate(Aggregate),
}

#[derive(Debug)]
struct Vertex {
    name: String,
    kind: VertexKind,
    value: f64,
    /// Vertices this one is computed from.
    inputs: Vec<VertexId>,
    /// Back-references to the vertices computed from this one.
    dependents: Vec<VertexId>,
}

/// Derived values over a set of inputs, kept current as the inputs change.
///
/// Vertices live in an arena and refer to each other by index: an aggregate
/// lists its inputs, every vertex lists the aggregates that read it. Edges that
/// would close a cycle are refused, so a change is re-evaluated once per
/// affected vertex, in topological order.
#[derive(Debug, Default)]
pub struct CalculationGraph {
    vertices: Vec<Vertex>,
    by_name: HashMap<String, VertexId>,
}

impl CalculationGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    pub fn add_input(&mut self, name: &str, value: f64) -> VertexId {
        self.push(name, VertexKind::Input, value, Vec::new())
    }

    /// Adds an aggregate over `inputs`. Ids this graph does not know are
    /// logged and left out.
    pub fn add_aggregate(&mut self, name: &str, aggregate: Aggregate, inputs: &[VertexId]) -> VertexId {
        let known: Vec<VertexId> = inputs
            .iter()
            .copied()
            .filter(|input| {
                let exists = self.vertex(*input).is_some();
                if !exists {
                    tracing::error!("Aggregate {} refers to unknown vertex {:?}", name, input);
                }
                exists
            })
            .collect();
        let value = aggregate.combine(known.iter().map(|input| self.vertices[input.0].value));
        let id = self.push(name, VertexKind::Aggregate(aggregate), value, known.clone());
        for input in known {
            self.vertices[input.0].dependents.push(id);
        }
        id
    }

    /// Makes `input` an input of the aggregate `vertex`.
    pub fn attach(&mut self, vertex: VertexId, input: VertexId) -> Result<(), SchedulerError> {
        self.aggregate_kind(vertex)?;
        self.vertex(input)
            .ok_or_else(|| SchedulerError::Metric(format!("unknown vertex {:?}", input)))?;
        if self.vertices[vertex.0].inputs.contains(&input) {
            return Ok(());
        }
        if self.depends_on(input, vertex) {
            return Err(SchedulerError::Metric(format!(
                "{} -> {} would close a cycle",
                self.vertices[input.0].name, self.vertices[vertex.0].name
            )));
        }
        self.vertices[vertex.0].inputs.push(input);
        self.vertices[input.0].dependents.push(vertex);
        self.evaluate(vertex);
        self.propagate(vertex);
        Ok(())
    }

    pub fn detach(&mut self, vertex: VertexId, input: VertexId) -> Result<(), SchedulerError> {
        self.aggregate_kind(vertex)?;
        let inputs = &mut self.vertices[vertex.0].inputs;
        let before = inputs.len();
        inputs.retain(|existing| *existing != input);
        if inputs.len() == before {
            return Ok(());
        }
        self.vertices[input.0]
            .dependents
            .retain(|dependent| *dependent != vertex);
        self.evaluate(vertex);
        self.propagate(vertex);
        Ok(())
    }

    /// Sets an input and re-evaluates everything downstream of it.
    ///
    /// Returns the aggregates whose value changed.
    pub fn set(&mut self, input: VertexId, value: f64) -> Result<Vec<VertexId>, SchedulerError> {
        let vertex = self
            .vertex(input)
            .ok_or_else(|| SchedulerError::Metric(format!("unknown vertex {:?}", input)))?;
        if vertex.kind != VertexKind::Input {
            return Err(SchedulerError::Metric(format!("{} is not an input", vertex.name)));
        }
        if vertex.value == value {
            return Ok(Vec::new());
        }
        self.vertices[input.0].value = value;
        Ok(self.propagate(input))
    }

    pub fn value(&self, id: VertexId) -> Option<f64> {
        self.vertex(id).map(|vertex| vertex.value)
    }

    pub fn id_of(&self, name: &str) -> Option<VertexId> {
        self.by_name.get(name).copied()
    }

    pub fn value_of(&self, name: &str) -> Option<f64> {
        self.id_of(name).and_then(|id| self.value(id))
    }

    pub fn values(&self) -> BTreeMap<String, f64> {
        self.vertices
            .iter()
            .map(|vertex| (vertex.name.clone(), vertex.value))
            .collect()
    }

    fn push(&mut self, name: &str, kind: VertexKind, value: f64, inputs: Vec<VertexId>) -> VertexId {
        let id = VertexId(self.vertices.len());
        self.vertices.push(Vertex {
            name: name.to_string(),
            kind,
            value,
            inputs,
            dependents: Vec::new(),
        });
        // Later vertices shadow earlier ones of the same name.
        self.by_name.insert(name.to_string(), id);
        id
    }

    fn vertex(&self, id: VertexId) -> Option<&Vertex> {
        self.vertices.get(id.0)
    }

    fn aggregate_kind(&self, id: VertexId) -> Result<Aggregate, SchedulerError> {
        match self.vertex(id).map(|vertex| vertex.kind) {
            Some(VertexKind::Aggregate(aggregate)) => Ok(aggregate),
            Some(VertexKind::Input) => Err(SchedulerError::Metric(format!(
                "{} is an input, not an aggregate",
                self.vertices[id.0].name
            ))),
            None => Err(SchedulerError::Metric(format!("unknown vertex {:?}", id))),
        }
    }

    /// Whether `from` is computed, directly or transitively, from `target`.
    fn depends_on(&self, from: VertexId, target: VertexId) -> bool {
        let mut stack = vec![from];
        let mut seen = HashSet::new();
        while let Some(current) = stack.pop() {
            if current == target {
                return true;
            }
            if seen.insert(current) {
                stack.extend(self.vertices[current.0].inputs.iter().copied());
            }
        }
        false
    }

    fn evaluate(&mut self, id: VertexId) -> bool {
        let VertexKind::Aggregate(aggregate) = self.vertices[id.0].kind else {
            return false;
        };
        let vertex = &self.vertices[id.0];
        let value = aggregate.combine(vertex.inputs.iter().map(|input| self.vertices[input.0].value));
        let changed = value != self.vertices[id.0].value;
        self.vertices[id.0].value = value;
        changed
    }

    /// Re-evaluates every vertex downstream of `start`, each after all of its
    /// affected inputs.
    fn propagate(&mut self, start: VertexId) -> Vec<VertexId> {
        let mut affected = HashSet::new();
        let mut frontier = vec![start];
        while let Some(current) = frontier.pop() {
            for dependent in &self.vertices[current.0].dependents {
                if affected.insert(*dependent) {
                    frontier.push(*dependent);
                }
            }
        }

        let mut pending: HashMap<VertexId, usize> = affected
            .iter()
            .map(|id| {
                let waiting = self.vertices[id.0]
                    .inputs
                    .iter()
                    .filter(|input| **input == start || affected.contains(*input))
                    .count();
                (*id, waiting)
            })
            .collect();

        let mut changed = Vec::new();
        let mut ready = VecDeque::from([start]);
        while let Some(current) = ready.pop_front() {
            if current != start && self.evaluate(current) {
                changed.push(current);
            }
            for dependent in self.vertices[current.0].dependents.clone() {
                let Some(waiting) = pending.get_mut(&dependent) else {
                    continue;
                };
                *waiting -= 1;
                if *waiting == 0 {
                    ready.push_back(dependent);
                }
            }
        }
        changed
    }
}
