// Computation graph: configuration, deterministic build, and execution.
//
// A graph is configured as named inputs plus named vertices wired by
// input name, then built once. Building validates the wiring, computes a
// deterministic topological order (ties broken by insertion order),
// infers every vertex's output shape, lays out the flat parameter and
// gradient buffers in topological order, and initializes parameters from
// the configured seed. Two builds of the same configuration produce the
// same order, the same layout, and the same initial parameters.
//
// Execution is split from the graph state: `forward` returns an
// `Evaluation` holding every vertex's activations, masks, and traces for
// one pass. `backward` and the scoring methods consume that evaluation,
// so nothing about a pass survives it.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use log::debug;
use ndarray::{Array2, ArrayD};
use rand::rngs::StdRng;
use rand::SeedableRng;

use vole_core::{
    bail, Activations, Dim, Error, Gradients, MaskState, MemoryReport, ModelBuffers,
    ParamLayout, Result, Slot, TensorShape,
};
use vole_nn::vertex::{Trace, VertexConfig};
use vole_nn::{LossLayer, OutputLayer};

/// Where one of a vertex's input edges comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    /// A graph input, by position.
    Input(usize),
    /// Another vertex's output, by position.
    Vertex(usize),
}

#[derive(Debug)]
struct Node {
    name: String,
    config: VertexConfig,
    sources: Vec<Source>,
}

struct VertexSpec {
    name: String,
    config: VertexConfig,
    inputs: Vec<String>,
}

/// Builder for a [`ComputationGraph`].
#[derive(Default)]
pub struct GraphConfig {
    seed: u64,
    inputs: Vec<(String, TensorShape)>,
    vertices: Vec<VertexSpec>,
    outputs: Vec<String>,
}

impl GraphConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed for parameter initialization and all training-time randomness.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Declare a graph input with its shape.
    pub fn input(mut self, name: impl Into<String>, shape: TensorShape) -> Self {
        self.inputs.push((name.into(), shape));
        self
    }

    /// Add a vertex fed by the named inputs or vertices.
    pub fn vertex(
        mut self,
        name: impl Into<String>,
        config: VertexConfig,
        inputs: &[&str],
    ) -> Self {
        self.vertices.push(VertexSpec {
            name: name.into(),
            config,
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
        });
        self
    }

    /// Mark a vertex as a network output. Output order determines the
    /// order labels are supplied to `backward` and `score`.
    pub fn output(mut self, name: impl Into<String>) -> Self {
        self.outputs.push(name.into());
        self
    }

    /// Validate the wiring and build the graph.
    pub fn build(self) -> Result<ComputationGraph> {
        if self.inputs.is_empty() {
            bail!("graph has no inputs");
        }
        if self.vertices.is_empty() {
            bail!("graph has no vertices");
        }

        let mut input_index = HashMap::new();
        for (i, (name, _)) in self.inputs.iter().enumerate() {
            if input_index.insert(name.clone(), i).is_some() {
                bail!("duplicate input name '{name}'");
            }
        }
        let mut vertex_index = HashMap::new();
        for (i, spec) in self.vertices.iter().enumerate() {
            if input_index.contains_key(&spec.name) {
                bail!("vertex '{}' shadows an input of the same name", spec.name);
            }
            if vertex_index.insert(spec.name.clone(), i).is_some() {
                bail!("duplicate vertex name '{}'", spec.name);
            }
        }

        let mut nodes = Vec::with_capacity(self.vertices.len());
        for spec in &self.vertices {
            let mut sources = Vec::with_capacity(spec.inputs.len());
            for input in &spec.inputs {
                if let Some(&i) = input_index.get(input) {
                    sources.push(Source::Input(i));
                } else if let Some(&v) = vertex_index.get(input) {
                    sources.push(Source::Vertex(v));
                } else {
                    bail!("vertex '{}' references unknown input '{input}'", spec.name);
                }
            }
            let vertex = spec.config.as_vertex();
            vertex.arity().check(vertex.kind(), sources.len())?;
            nodes.push(Node {
                name: spec.name.clone(),
                config: spec.config.clone(),
                sources,
            });
        }

        let mut outputs = Vec::with_capacity(self.outputs.len());
        for name in &self.outputs {
            let Some(&v) = vertex_index.get(name) else {
                bail!("output '{name}' is not a vertex");
            };
            if outputs.contains(&v) {
                bail!("duplicate output '{name}'");
            }
            outputs.push(v);
        }

        let topo = topological_order(&nodes)?;
        debug!(
            "topological order: {:?}",
            topo.iter().map(|&v| nodes[v].name.as_str()).collect::<Vec<_>>()
        );

        let input_shapes: Vec<TensorShape> =
            self.inputs.iter().map(|(_, s)| s.clone()).collect();
        let shapes = infer_shapes(&nodes, &topo, &input_shapes)?;

        let layout = ParamLayout::build(
            topo.iter()
                .map(|&v| (nodes[v].name.as_str(), nodes[v].config.param_count())),
        );
        for span in layout.spans() {
            debug!("parameter span '{}': [{}, {})", span.name, span.offset, span.offset + span.len);
        }
        let mut buffers = ModelBuffers::new(layout);
        let mut rng = StdRng::seed_from_u64(self.seed);
        for &v in &topo {
            let node = &nodes[v];
            if node.config.param_count() > 0 {
                let view = buffers.param_view_mut(&node.name)?;
                node.config.as_vertex().init_params(view, &mut rng)?;
            }
        }

        Ok(ComputationGraph {
            inputs: self.inputs,
            nodes,
            topo,
            shapes,
            outputs,
            buffers,
            rng,
        })
    }
}

/// Kahn's algorithm over vertex-to-vertex edges, popping the
/// lowest-insertion-index ready vertex first so the order is a pure
/// function of the configuration.
fn topological_order(nodes: &[Node]) -> Result<Vec<usize>> {
    let mut indegree = vec![0usize; nodes.len()];
    let mut consumers: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (v, node) in nodes.iter().enumerate() {
        for source in &node.sources {
            if let Source::Vertex(u) = source {
                indegree[v] += 1;
                consumers[*u].push(v);
            }
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = indegree
        .iter()
        .enumerate()
        .filter(|(_, &d)| d == 0)
        .map(|(v, _)| Reverse(v))
        .collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(Reverse(v)) = ready.pop() {
        order.push(v);
        for &c in &consumers[v] {
            indegree[c] -= 1;
            if indegree[c] == 0 {
                ready.push(Reverse(c));
            }
        }
    }
    if order.len() != nodes.len() {
        let stuck: Vec<&str> = indegree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d > 0)
            .map(|(v, _)| nodes[v].name.as_str())
            .collect();
        bail!("graph contains a cycle through {stuck:?}");
    }
    Ok(order)
}

fn infer_shapes(
    nodes: &[Node],
    topo: &[usize],
    input_shapes: &[TensorShape],
) -> Result<Vec<TensorShape>> {
    let mut shapes: Vec<Option<TensorShape>> = vec![None; nodes.len()];
    for &v in topo {
        let node = &nodes[v];
        let in_shapes: Vec<TensorShape> = node
            .sources
            .iter()
            .map(|s| match s {
                Source::Input(i) => input_shapes[*i].clone(),
                Source::Vertex(u) => shapes[*u]
                    .clone()
                    .unwrap_or_else(|| unreachable!("topological order violated")),
            })
            .collect();
        shapes[v] = Some(node.config.as_vertex().output_shape(&in_shapes)?);
    }
    Ok(shapes.into_iter().map(|s| s.unwrap_or_else(|| unreachable!())).collect())
}

/// One forward pass's worth of per-vertex state. Dropped after the
/// matching backward or scoring call; nothing in it outlives the pass.
#[derive(Debug)]
pub struct Evaluation {
    training: bool,
    activations: Vec<ArrayD<f64>>,
    masks: Vec<Option<ArrayD<f64>>>,
    mask_states: Vec<MaskState>,
    traces: Vec<Trace>,
}

impl Evaluation {
    pub fn training(&self) -> bool {
        self.training
    }
}

/// A built, executable computation graph.
#[derive(Debug)]
pub struct ComputationGraph {
    inputs: Vec<(String, TensorShape)>,
    nodes: Vec<Node>,
    topo: Vec<usize>,
    shapes: Vec<TensorShape>,
    outputs: Vec<usize>,
    buffers: ModelBuffers,
    rng: StdRng,
}

impl ComputationGraph {
    /// Number of graph inputs, in declaration order.
    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    /// Number of declared network outputs.
    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    /// Vertex names in topological order.
    pub fn topological_names(&self) -> Vec<&str> {
        self.topo.iter().map(|&v| self.nodes[v].name.as_str()).collect()
    }

    /// The inferred output shape of a vertex.
    pub fn shape_of(&self, name: &str) -> Result<&TensorShape> {
        Ok(&self.shapes[self.index_of(name)?])
    }

    /// Total trainable parameter count.
    pub fn param_count(&self) -> usize {
        self.buffers.layout().total_len()
    }

    /// The flat parameter buffer.
    pub fn params(&self) -> &[f64] {
        self.buffers.params()
    }

    /// Mutable access to the flat parameter buffer (optimizer updates).
    pub fn params_mut(&mut self) -> &mut [f64] {
        self.buffers.params_mut()
    }

    /// Replace the parameter buffer from an external flat array.
    pub fn set_params(&mut self, values: &[f64]) -> Result<()> {
        self.buffers.set_params(values)
    }

    /// The flat gradient buffer, as written by the last backward pass.
    pub fn grads(&self) -> &[f64] {
        self.buffers.grads()
    }

    /// The parameter layout (span per parametrized vertex, in
    /// topological order).
    pub fn layout(&self) -> &ParamLayout {
        self.buffers.layout()
    }

    /// Summed pre-flight memory estimate over all vertices.
    pub fn memory_report(&self) -> Result<MemoryReport> {
        let mut total = MemoryReport::none();
        for &v in &self.topo {
            let in_shapes = self.source_shapes(v);
            let r = self.nodes[v].config.as_vertex().memory_report(&in_shapes)?;
            total.param_bytes += r.param_bytes;
            total.working_bytes += r.working_bytes;
            total.cache_bytes += r.cache_bytes;
        }
        Ok(total)
    }

    /// Forward pass without masks.
    pub fn forward(&mut self, inputs: &[ArrayD<f64>], training: bool) -> Result<Evaluation> {
        let masks = vec![None; inputs.len()];
        self.forward_masked(inputs, &masks, training)
    }

    /// Forward pass with optional per-input masks.
    pub fn forward_masked(
        &mut self,
        inputs: &[ArrayD<f64>],
        masks: &[Option<ArrayD<f64>>],
        training: bool,
    ) -> Result<Evaluation> {
        if inputs.len() != self.inputs.len() {
            return Err(Error::SizeMismatch {
                kind: "graph inputs",
                expected: self.inputs.len(),
                got: inputs.len(),
            });
        }
        if masks.len() != inputs.len() {
            return Err(Error::SizeMismatch {
                kind: "graph input masks",
                expected: inputs.len(),
                got: masks.len(),
            });
        }
        for ((name, shape), arr) in self.inputs.iter().zip(inputs) {
            check_runtime_shape(name, shape, arr)?;
        }

        let n = self.nodes.len();
        let mut activations: Vec<Option<ArrayD<f64>>> = vec![None; n];
        let mut out_masks: Vec<Option<ArrayD<f64>>> = vec![None; n];
        let mut mask_states: Vec<MaskState> = vec![MaskState::Active; n];
        let mut traces: Vec<Trace> = (0..n).map(|_| Trace::None).collect();

        for &v in &self.topo {
            let bundle = {
                let node = &self.nodes[v];
                let slots: Vec<Slot> = node
                    .sources
                    .iter()
                    .map(|s| match s {
                        Source::Input(i) => Slot {
                            array: Some(inputs[*i].clone()),
                            mask: masks[*i].clone(),
                            mask_state: MaskState::Active,
                        },
                        Source::Vertex(u) => Slot {
                            array: activations[*u].clone(),
                            mask: out_masks[*u].clone(),
                            mask_state: mask_states[*u],
                        },
                    })
                    .collect();
                Activations::from_slots(slots)
            };

            let (out, trace) = {
                let node = &self.nodes[v];
                let vertex = node.config.as_vertex();
                if node.config.param_count() > 0 {
                    let params = self.buffers.param_view(&node.name)?;
                    vertex.forward(params, &bundle, training, &mut self.rng)?
                } else {
                    vertex.forward(&[], &bundle, training, &mut self.rng)?
                }
            };
            let slot = out
                .slots()
                .first()
                .cloned()
                .ok_or_else(|| Error::msg(format!("vertex '{}' produced no output", self.nodes[v].name)))?;
            activations[v] = slot.array;
            out_masks[v] = slot.mask;
            mask_states[v] = slot.mask_state;
            traces[v] = trace;
        }

        let activations = activations
            .into_iter()
            .map(|a| a.ok_or_else(|| Error::msg("vertex produced no activations")))
            .collect::<Result<Vec<_>>>()?;
        Ok(Evaluation {
            training,
            activations,
            masks: out_masks,
            mask_states,
            traces,
        })
    }

    /// A vertex's activations from an evaluation.
    pub fn activations_of<'a>(&self, eval: &'a Evaluation, name: &str) -> Result<&'a ArrayD<f64>> {
        Ok(&eval.activations[self.index_of(name)?])
    }

    /// A vertex's output mask from an evaluation, if any.
    pub fn mask_of<'a>(&self, eval: &'a Evaluation, name: &str) -> Result<Option<&'a ArrayD<f64>>> {
        Ok(eval.masks[self.index_of(name)?].as_ref())
    }

    /// How a vertex's output mask should be treated downstream.
    pub fn mask_state_of(&self, eval: &Evaluation, name: &str) -> Result<MaskState> {
        Ok(eval.mask_states[self.index_of(name)?])
    }

    /// The declared network outputs' activations, in output order.
    pub fn output_activations<'a>(&self, eval: &'a Evaluation) -> Vec<&'a ArrayD<f64>> {
        self.outputs.iter().map(|&v| &eval.activations[v]).collect()
    }

    /// Backward pass. Labels are supplied per declared output, in output
    /// order; every declared output must be an output or loss layer.
    /// Parameter
    /// gradients land in the flat gradient buffer; the return value is
    /// the loss gradient with respect to each graph input (None for
    /// inputs no output depends on).
    pub fn backward(
        &mut self,
        eval: &Evaluation,
        labels: &[Array2<f64>],
        label_masks: &[Option<ArrayD<f64>>],
    ) -> Result<Vec<Option<ArrayD<f64>>>> {
        if !eval.training {
            return Err(Error::InvalidInput {
                kind: "graph",
                detail: "backward requires a training-mode evaluation".into(),
            });
        }
        if labels.len() != self.outputs.len() {
            return Err(Error::SizeMismatch {
                kind: "labels",
                expected: self.outputs.len(),
                got: labels.len(),
            });
        }
        if !label_masks.is_empty() && label_masks.len() != labels.len() {
            return Err(Error::SizeMismatch {
                kind: "label masks",
                expected: labels.len(),
                got: label_masks.len(),
            });
        }
        self.buffers.zero_grads();

        let mut acc: Vec<Option<ArrayD<f64>>> = vec![None; self.nodes.len()];
        let mut input_acc: Vec<Option<ArrayD<f64>>> = vec![None; self.inputs.len()];

        for &v in self.topo.iter().rev() {
            let output_pos = self.outputs.iter().position(|&o| o == v);
            let bundle = if let Some(oi) = output_pos {
                let mask = label_masks.get(oi).and_then(|m| m.as_ref());
                match &self.nodes[v].config {
                    VertexConfig::Output(layer) => {
                        let layer: OutputLayer = *layer;
                        let (params, grads) =
                            self.buffers.views_mut(&self.nodes[v].name)?;
                        layer.backward_labelled(
                            params,
                            grads,
                            &eval.traces[v],
                            &labels[oi],
                            mask,
                        )?
                    }
                    VertexConfig::LossOutput(layer) => {
                        layer.backward_labelled(&eval.traces[v], &labels[oi], mask)?
                    }
                    _ => {
                        return Err(Error::InvalidInput {
                            kind: "graph",
                            detail: format!(
                                "output '{}' is not an output layer and cannot seed \
                                 the backward pass",
                                self.nodes[v].name
                            ),
                        });
                    }
                }
            } else {
                let Some(eps) = acc[v].take() else {
                    // nothing downstream consumed this vertex
                    continue;
                };
                let eps = Gradients::single(eps);
                if self.nodes[v].config.param_count() > 0 {
                    let (params, grads) = self.buffers.views_mut(&self.nodes[v].name)?;
                    self.nodes[v]
                        .config
                        .as_vertex()
                        .backward(params, grads, &eval.traces[v], &eps)?
                } else {
                    self.nodes[v]
                        .config
                        .as_vertex()
                        .backward(&[], &mut [], &eval.traces[v], &eps)?
                }
            };

            for (slot, eps) in bundle.into_epsilons().into_iter().enumerate() {
                let Some(eps) = eps else { continue };
                match self.nodes[v].sources[slot] {
                    Source::Input(i) => accumulate(&mut input_acc[i], eps)?,
                    Source::Vertex(u) => accumulate(&mut acc[u], eps)?,
                }
            }
        }
        Ok(input_acc)
    }

    /// Scalar score: the mean per-example loss of every declared output
    /// summed, plus the network's L1 and L2 penalties added once.
    pub fn score(
        &self,
        eval: &Evaluation,
        labels: &[Array2<f64>],
        label_masks: &[Option<ArrayD<f64>>],
    ) -> Result<f64> {
        if labels.len() != self.outputs.len() {
            return Err(Error::SizeMismatch {
                kind: "labels",
                expected: self.outputs.len(),
                got: labels.len(),
            });
        }
        let (l1, l2) = self.penalties();
        let mut score = l1 + l2;
        for (oi, layer, v) in self.scored_outputs()? {
            let mask = label_masks.get(oi).and_then(|m| m.as_ref());
            score += layer.compute_score(&eval.traces[v], &labels[oi], mask)?;
        }
        Ok(score)
    }

    /// Per-example score column `[batch, 1]`: output losses summed per
    /// example, penalties added to every row.
    pub fn score_per_example(
        &self,
        eval: &Evaluation,
        labels: &[Array2<f64>],
        label_masks: &[Option<ArrayD<f64>>],
    ) -> Result<Array2<f64>> {
        if labels.len() != self.outputs.len() {
            return Err(Error::SizeMismatch {
                kind: "labels",
                expected: self.outputs.len(),
                got: labels.len(),
            });
        }
        let (l1, l2) = self.penalties();
        let mut total: Option<Array2<f64>> = None;
        for (oi, layer, v) in self.scored_outputs()? {
            let mask = label_masks.get(oi).and_then(|m| m.as_ref());
            let col = layer.score_per_example(&eval.traces[v], &labels[oi], mask)?;
            match &mut total {
                None => total = Some(col),
                Some(t) => {
                    if t.dim() != col.dim() {
                        return Err(Error::IncompatibleShapes {
                            kind: "graph",
                            detail: "outputs disagree on minibatch size".into(),
                        });
                    }
                    *t += &col;
                }
            }
        }
        let mut total = total.ok_or_else(|| Error::msg("graph has no outputs to score"))?;
        total.mapv_inplace(|v| v + l1 + l2);
        Ok(total)
    }

    /// One unsupervised pretraining step on a named autoencoder vertex.
    /// Writes its gradients into the flat gradient view (other vertices'
    /// views are untouched) and returns the reconstruction error.
    pub fn pretrain_step(&mut self, name: &str, x: &Array2<f64>) -> Result<f64> {
        let v = self.index_of(name)?;
        let VertexConfig::AutoEncoder(ae) = &self.nodes[v].config else {
            return Err(Error::InvalidInput {
                kind: "graph",
                detail: format!("vertex '{name}' is not an autoencoder"),
            });
        };
        let ae = *ae;
        let (params, grads) = self.buffers.views_mut(name)?;
        ae.pretrain_gradient(params, grads, x, &mut self.rng)
    }

    /// Summed (l1, l2) penalty over every parametrized vertex.
    fn penalties(&self) -> (f64, f64) {
        let mut l1 = 0.0;
        let mut l2 = 0.0;
        for node in &self.nodes {
            if node.config.param_count() == 0 {
                continue;
            }
            if let Ok(params) = self.buffers.param_view(&node.name) {
                let (a, b) = node.config.as_vertex().score_penalty(params);
                l1 += a;
                l2 += b;
            }
        }
        (l1, l2)
    }

    fn scored_outputs(&self) -> Result<Vec<(usize, ScoredOutput<'_>, usize)>> {
        let mut out = Vec::with_capacity(self.outputs.len());
        for (oi, &v) in self.outputs.iter().enumerate() {
            let scored = match &self.nodes[v].config {
                VertexConfig::Output(layer) => ScoredOutput::Layer(layer),
                VertexConfig::LossOutput(layer) => ScoredOutput::Loss(layer),
                _ => {
                    return Err(Error::InvalidInput {
                        kind: "graph",
                        detail: format!(
                            "output '{}' is not an output layer",
                            self.nodes[v].name
                        ),
                    });
                }
            };
            out.push((oi, scored, v));
        }
        Ok(out)
    }

    fn source_shapes(&self, v: usize) -> Vec<TensorShape> {
        self.nodes[v]
            .sources
            .iter()
            .map(|s| match s {
                Source::Input(i) => self.inputs[*i].1.clone(),
                Source::Vertex(u) => self.shapes[*u].clone(),
            })
            .collect()
    }

    fn index_of(&self, name: &str) -> Result<usize> {
        self.nodes
            .iter()
            .position(|n| n.name == name)
            .ok_or_else(|| Error::msg(format!("no vertex named '{name}'")))
    }
}

/// A declared network output that can be scored against labels: a fully
/// connected output layer or a parameterless loss layer.
enum ScoredOutput<'a> {
    Layer(&'a OutputLayer),
    Loss(&'a LossLayer),
}

impl ScoredOutput<'_> {
    fn compute_score(
        &self,
        trace: &Trace,
        labels: &Array2<f64>,
        mask: Option<&ArrayD<f64>>,
    ) -> Result<f64> {
        match self {
            ScoredOutput::Layer(l) => l.compute_score(trace, labels, mask, 0.0, 0.0),
            ScoredOutput::Loss(l) => l.compute_score(trace, labels, mask, 0.0, 0.0),
        }
    }

    fn score_per_example(
        &self,
        trace: &Trace,
        labels: &Array2<f64>,
        mask: Option<&ArrayD<f64>>,
    ) -> Result<Array2<f64>> {
        match self {
            ScoredOutput::Layer(l) => l.score_per_example(trace, labels, mask, 0.0, 0.0),
            ScoredOutput::Loss(l) => l.score_per_example(trace, labels, mask, 0.0, 0.0),
        }
    }
}

/// Sum an epsilon into an accumulator slot.
fn accumulate(acc: &mut Option<ArrayD<f64>>, eps: ArrayD<f64>) -> Result<()> {
    match acc {
        None => *acc = Some(eps),
        Some(existing) => {
            if existing.shape() != eps.shape() {
                return Err(Error::IncompatibleShapes {
                    kind: "graph",
                    detail: format!(
                        "fan-out epsilons disagree: {:?} vs {:?}",
                        existing.shape(),
                        eps.shape()
                    ),
                });
            }
            *existing += &eps;
        }
    }
    Ok(())
}

/// Check a runtime tensor against its input's declared shape. Unknown
/// dims accept anything; known dims must match exactly.
fn check_runtime_shape(name: &str, shape: &TensorShape, arr: &ArrayD<f64>) -> Result<()> {
    let fail = |detail: String| {
        Err(Error::InvalidInput {
            kind: "graph",
            detail: format!("input '{name}': {detail}"),
        })
    };
    if arr.ndim() != shape.rank() {
        return fail(format!(
            "expected rank {} ({}), got rank {}",
            shape.rank(),
            shape.kind_name(),
            arr.ndim()
        ));
    }
    if let Dim::Known(n) = shape.feature_size() {
        let axis1 = if matches!(shape, TensorShape::ConvolutionalFlat { .. }) {
            // flat inputs carry depth*width*height along axis 1
            match shape.flattened_size() {
                Dim::Known(total) => total,
                Dim::Unknown => return Ok(()),
            }
        } else {
            n
        };
        if arr.shape()[1] != axis1 {
            return fail(format!(
                "expected feature size {axis1}, got {}",
                arr.shape()[1]
            ));
        }
    }
    if let TensorShape::Recurrent { steps: Dim::Known(t), .. } = shape {
        if arr.shape()[2] != *t {
            return fail(format!("expected {t} time steps, got {}", arr.shape()[2]));
        }
    }
    if let TensorShape::Convolutional { height, width, .. } = shape {
        if arr.shape()[2] != *width || arr.shape()[3] != *height {
            return fail(format!(
                "expected spatial dims {width}x{height}, got {}x{}",
                arr.shape()[2],
                arr.shape()[3]
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vole_nn::{DenseLayer, Loss, Merge, OutputLayer, Scale};

    fn ff(n: usize) -> TensorShape {
        TensorShape::feed_forward(n)
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let err = GraphConfig::new()
            .input("in", ff(2))
            .vertex("a", VertexConfig::Scale(Scale::new(1.0)), &["in"])
            .vertex("a", VertexConfig::Scale(Scale::new(2.0)), &["in"])
            .build();
        assert!(err.is_err());
    }

    #[test]
    fn test_unknown_reference_rejected() {
        let err = GraphConfig::new()
            .input("in", ff(2))
            .vertex("a", VertexConfig::Scale(Scale::new(1.0)), &["nope"])
            .build();
        assert!(err.is_err());
    }

    #[test]
    fn test_cycle_rejected() {
        let err = GraphConfig::new()
            .input("in", ff(2))
            .vertex(
                "a",
                VertexConfig::Merge(Merge::new()),
                &["in", "b"],
            )
            .vertex("b", VertexConfig::Scale(Scale::new(1.0)), &["a"])
            .build();
        assert!(err.is_err());
    }

    #[test]
    fn test_shape_inference_failure_surfaces() {
        let err = GraphConfig::new()
            .input("in", ff(3))
            .vertex(
                "dense",
                VertexConfig::Dense(DenseLayer::new(4, 2)),
                &["in"],
            )
            .build();
        assert!(matches!(err, Err(Error::IncompatibleShapes { .. })));
    }

    #[test]
    fn test_layout_in_topological_order() {
        let graph = GraphConfig::new()
            .input("in", ff(3))
            .vertex("d1", VertexConfig::Dense(DenseLayer::new(3, 4)), &["in"])
            .vertex(
                "out",
                VertexConfig::Output(OutputLayer::new(4, 2, Loss::Mse)),
                &["d1"],
            )
            .output("out")
            .build()
            .unwrap();
        let names: Vec<&str> = graph.layout().ordered_names().collect();
        assert_eq!(names, vec!["d1", "out"]);
        assert_eq!(graph.param_count(), (3 * 4 + 4) + (4 * 2 + 2));
        assert_eq!(graph.shape_of("out").unwrap(), &ff(2));
    }

    #[test]
    fn test_same_seed_same_params() {
        let build = || {
            GraphConfig::new()
                .seed(11)
                .input("in", ff(3))
                .vertex("d1", VertexConfig::Dense(DenseLayer::new(3, 4)), &["in"])
                .vertex(
                    "out",
                    VertexConfig::Output(OutputLayer::new(4, 2, Loss::Mse)),
                    &["d1"],
                )
                .output("out")
                .build()
                .unwrap()
        };
        let g1 = build();
        let g2 = build();
        assert_eq!(g1.params(), g2.params());
        assert_eq!(g1.topological_names(), g2.topological_names());
    }
}
