//! The operator legality checker.
//!
//! A constraint is a pure predicate over one operator together with the
//! human-readable rule it enforces. [`SupportedOperators`] holds the generic
//! constraints applied to every operator and a per-kind registry of specific
//! constraints; an operator runs on the NPU iff it belongs to the supported
//! set and every constraint passes. Rejections are reported to stderr with
//! the rule text and the offending tensor or attribute, and the operator
//! falls back to CPU placement in the pass packer.

use std::collections::HashMap;

use crate::consts::{DataType, OpKind, Padding};
use crate::graph::{format_shape, Attr, Graph, OpId, Operation, TensorId};

const TENS_DIM_RANGE: (u32, u32) = (1, 65535);
const STRIDE_RANGE: (i64, i64) = (1, 3);
const DILATION_RANGE: (i64, i64) = (1, 2);
const DILATED_HEIGHT_RANGE: (i64, i64) = (1, 64);
const DILATED_PRODUCT_RANGE: (i64, i64) = (1, 64 * 64);
const WEIGHTS_LIMIT: i64 = 127 * 65536;
const FILTER_RANGE: (i64, i64) = (1, 8);
const FILTER_HEIGHT_RANGE: (i64, i64) = (1, 256);
const FILTER_PRODUCT_RANGE: (i64, i64) = (1, 256 * 256);

/// Result of evaluating one constraint: the verdict plus extra detail
/// naming the offending tensors or attribute values.
#[derive(Debug, Clone)]
pub struct Check {
    /// Whether the constraint holds.
    pub valid: bool,
    /// Detail text for the diagnostic.
    pub extra: String,
}

impl Check {
    fn new(valid: bool, extra: impl Into<String>) -> Self {
        Check {
            valid,
            extra: extra.into(),
        }
    }
}

type ConstraintFn = fn(&Graph, &Operation) -> Check;

/// A single legality rule: the predicate plus its description, used verbatim
/// in diagnostics.
pub struct Constraint {
    /// The rule, phrased the way it is reported.
    pub doc: &'static str,
    check: ConstraintFn,
}

impl Constraint {
    const fn new(doc: &'static str, check: ConstraintFn) -> Self {
        Constraint { doc, check }
    }

    /// Evaluates the rule against one operator.
    pub fn check(&self, graph: &Graph, op: &Operation) -> Check {
        (self.check)(graph, op)
    }
}

/// Whether the kind may take scalar (shapeless) inputs.
fn is_shapeless_input_op(kind: OpKind) -> bool {
    kind.is_binary_elementwise() || matches!(kind, OpKind::Split | OpKind::SplitV)
}

/// Whether the kind may carry int32 tensors.
fn is_supported_int32_op(kind: OpKind) -> bool {
    matches!(kind, OpKind::ReduceSum | OpKind::Clz)
        || kind.is_binary_add_mul_sub()
        || kind.is_binary_shift()
}

/// Whether the kind is valid as a fused activation function.
fn is_supported_fused_activation(kind: OpKind) -> bool {
    kind.is_relu() || matches!(kind, OpKind::Tanh | OpKind::Sigmoid | OpKind::Lut)
}

fn is_supported_dtype(dtype: DataType) -> bool {
    matches!(
        dtype,
        DataType::UInt8 | DataType::Int8 | DataType::Int16 | DataType::Int32
    )
}

/// NPU post-operations the checker accepts.
fn is_npu_post_op(kind: OpKind) -> bool {
    kind.is_activation() || matches!(kind, OpKind::ConcatSliceWrite | OpKind::Quantize)
}

/// The set of operators the NPU can run at all; everything else is CPU-only
/// regardless of its parameters.
pub fn is_supported_operator(kind: OpKind) -> bool {
    kind.is_npu_pre()
        || kind.is_mac_main()
        || kind.is_elementwise_main()
        || is_npu_post_op(kind)
        || kind.is_memory_op()
}

/// The IFM, IFM2, weight and OFM tensors of the operator, falling back to
/// the plain input list for operators without feature-map conventions.
fn feature_or_input_tensors(op: &Operation) -> Vec<TensorId> {
    let tensors = op.feature_tensors();
    if tensors.is_empty() {
        op.inputs.clone()
    } else {
        tensors
    }
}

fn in_range(value: i64, range: (i64, i64)) -> bool {
    range.0 <= value && value <= range.1
}

fn dims_of(graph: &Graph, id: TensorId) -> Vec<i64> {
    graph
        .tensor(id)
        .shape
        .iter()
        .map(|d| d.map(i64::from).unwrap_or(0))
        .collect()
}

fn constraint_tens_no_dynamic(graph: &Graph, op: &Operation) -> Check {
    let mut offenders = Vec::new();
    for &id in op.inputs.iter().chain(op.outputs.iter()) {
        let tens = graph.tensor(id);
        if tens.is_dynamic() {
            offenders.push(tens.name.clone());
        }
    }
    Check::new(
        offenders.is_empty(),
        format!("Op has dynamic tensor(s): {}", offenders.join(", ")),
    )
}

fn constraint_tens_defined_shape(graph: &Graph, op: &Operation) -> Check {
    let mut offenders = Vec::new();
    for &id in op.inputs.iter().chain(op.outputs.iter()) {
        let tens = graph.tensor(id);
        if !tens.has_fully_defined_shape() {
            offenders.push(format!(
                "Tensor '{}' has shape: {}",
                tens.name,
                format_shape(&tens.shape)
            ));
        }
    }
    Check::new(offenders.is_empty(), offenders.join(", "))
}

fn constraint_tens_output_scalar(graph: &Graph, op: &Operation) -> Check {
    match op.ofm() {
        Some(ofm) => {
            let tens = graph.tensor(ofm);
            Check::new(
                !tens.is_scalar(),
                format!("Output Tensor '{}' is scalar", tens.name),
            )
        }
        None => Check::new(false, "Op has no output tensor"),
    }
}

fn constraint_tens_input_scalar(graph: &Graph, op: &Operation) -> Check {
    let mut offenders = Vec::new();
    if !is_shapeless_input_op(op.kind) {
        for &id in &op.inputs {
            let tens = graph.tensor(id);
            if tens.is_scalar() {
                offenders.push(tens.name.clone());
            }
        }
    }
    Check::new(
        offenders.is_empty(),
        format!("Op has scalar input tensor(s): {}", offenders.join(", ")),
    )
}

fn constraint_tens_shape_size(graph: &Graph, op: &Operation) -> Check {
    let mut offenders = Vec::new();
    for &id in op.inputs.iter().chain(op.outputs.iter()) {
        let tens = graph.tensor(id);
        if tens.rank() > 4 {
            offenders.push(format!(
                "Tensor '{}' has shape: {}",
                tens.name,
                format_shape(&tens.shape)
            ));
        }
    }
    Check::new(offenders.is_empty(), offenders.join(", "))
}

fn constraint_tens_dtype(graph: &Graph, op: &Operation) -> Check {
    let mut offenders = Vec::new();
    for id in feature_or_input_tensors(op) {
        let tens = graph.tensor(id);
        if !is_supported_dtype(tens.dtype) {
            offenders.push(format!(
                "Tensor '{}' has data type: {}",
                tens.name, tens.dtype
            ));
        }
    }
    Check::new(offenders.is_empty(), offenders.join(", "))
}

fn constraint_tens_int32_ops(graph: &Graph, op: &Operation) -> Check {
    let mut offenders = Vec::new();
    for id in feature_or_input_tensors(op) {
        let tens = graph.tensor(id);
        if tens.dtype == DataType::Int32 && !is_supported_int32_op(op.kind) {
            offenders.push(tens.name.clone());
        }
    }
    Check::new(
        offenders.is_empty(),
        format!("Op has int32 tensor(s): {}", offenders.join(", ")),
    )
}

fn constraint_tens_dimension(graph: &Graph, op: &Operation) -> Check {
    let (tens_min, tens_max) = TENS_DIM_RANGE;
    let mut offenders = Vec::new();
    for id in feature_or_input_tensors(op) {
        let tens = graph.tensor(id);
        let valid = tens
            .shape
            .iter()
            .all(|d| d.is_some_and(|d| tens_min <= d && d <= tens_max));
        if !valid {
            offenders.push(format!(
                "Tensor '{}' has shape: {}",
                tens.name,
                format_shape(&tens.shape)
            ));
        }
    }
    Check::new(offenders.is_empty(), offenders.join(", "))
}

fn constraint_tens_quant_none_check(graph: &Graph, op: &Operation) -> Check {
    let mut offenders = Vec::new();
    for id in op.feature_tensors() {
        let tens = graph.tensor(id);
        if tens.quantization.is_none() {
            offenders.push(tens.name.clone());
        }
    }
    Check::new(
        offenders.is_empty(),
        format!(
            "Op has tensors with missing quantization parameters: {}",
            offenders.join(", ")
        ),
    )
}

fn constraint_tens_quant_scale(graph: &Graph, op: &Operation) -> Check {
    let mut offenders = Vec::new();
    for id in op.feature_tensors() {
        let tens = graph.tensor(id);
        if let Some(scale) = tens.quantization.as_ref().and_then(|q| q.scale_f32) {
            if scale.is_infinite() {
                offenders.push(format!(
                    "Tensor '{}' has quantization scale: {}",
                    tens.name, scale
                ));
            }
        }
    }
    Check::new(offenders.is_empty(), offenders.join(", "))
}

fn constraint_tens_quant_per_axis(graph: &Graph, op: &Operation) -> Check {
    let mut offenders = Vec::new();
    if !op.kind.is_convolution_like() {
        for id in op.feature_tensors() {
            let tens = graph.tensor(id);
            if tens.quantization.as_ref().is_some_and(|q| q.is_per_axis()) {
                offenders.push(tens.name.clone());
            }
        }
    }
    Check::new(
        offenders.is_empty(),
        format!(
            "The following tensor(s) have per-axis quantization parameters: {}",
            offenders.join(", ")
        ),
    )
}

fn constraint_faf(_graph: &Graph, op: &Operation) -> Check {
    match &op.activation {
        None => Check::new(true, "Op has no fused activation function"),
        Some(act) => Check::new(
            is_supported_fused_activation(act.op),
            format!("Op has its fused activation function as: {:?}", act.op),
        ),
    }
}

fn constraint_stride_range(graph: &Graph, op: &Operation) -> Check {
    let kernel = op.kernel(graph);
    let valid = in_range(kernel.stride_w, STRIDE_RANGE) && in_range(kernel.stride_h, STRIDE_RANGE);
    Check::new(
        valid,
        format!(
            "Op has stride WxH as: {}x{}",
            kernel.stride_w, kernel.stride_h
        ),
    )
}

fn constraint_dilation_range(graph: &Graph, op: &Operation) -> Check {
    let kernel = op.kernel(graph);
    let valid =
        in_range(kernel.dilation_w, DILATION_RANGE) && in_range(kernel.dilation_h, DILATION_RANGE);
    Check::new(
        valid,
        format!(
            "Op has dilation factor WxH as: {}x{}",
            kernel.dilation_w, kernel.dilation_h
        ),
    )
}

fn constraint_dilated_height_range(graph: &Graph, op: &Operation) -> Check {
    let height = op.kernel(graph).area_height();
    Check::new(
        in_range(height, DILATED_HEIGHT_RANGE),
        format!("Op has dilated kernel height as: {height}"),
    )
}

fn constraint_dilated_product_range(graph: &Graph, op: &Operation) -> Check {
    let kernel = op.kernel(graph);
    let product = kernel.area_width() * kernel.area_height();
    Check::new(
        in_range(product, DILATED_PRODUCT_RANGE),
        format!("Op has product of dilated kernel width and height as: {product}"),
    )
}

fn constraint_weights_type(graph: &Graph, op: &Operation) -> Check {
    match op.weights() {
        Some(id) => {
            let weights = graph.tensor(id);
            Check::new(
                weights.element_size() == 1,
                format!(
                    "Tensor '{}' is {}-bit",
                    weights.name,
                    weights.element_size() * 8
                ),
            )
        }
        None => Check::new(false, "Op has no weight tensor"),
    }
}

fn constraint_weights_const(graph: &Graph, op: &Operation) -> Check {
    match op.weights() {
        Some(id) => {
            let weights = graph.tensor(id);
            Check::new(
                weights.values.is_some() || weights.quant_values.is_some(),
                format!("Tensor '{}' has non-constant values", weights.name),
            )
        }
        None => Check::new(false, "Op has no weight tensor"),
    }
}

fn constraint_weights_limit(graph: &Graph, op: &Operation) -> Check {
    let Some(id) = op.weights() else {
        return Check::new(false, "Op has no weight tensor");
    };
    let weights = graph.tensor(id);
    let Some(values) = weights.quant_values.as_ref().or(weights.values.as_ref()) else {
        return Check::new(true, format!("Tensor '{}' has no values", weights.name));
    };
    // Weights are stored HWIO; sum |w - zero_point| per output channel.
    let dims: Vec<usize> = weights
        .shape
        .iter()
        .map(|d| d.unwrap_or(1) as usize)
        .collect();
    let out_channels = dims.last().copied().unwrap_or(1).max(1);
    let per_channel = values.len() / out_channels;
    let mut limit = 0i64;
    for channel in 0..out_channels {
        let zero_point = weights
            .quantization
            .as_ref()
            .map(|q| q.zero_point_for(channel))
            .unwrap_or(0);
        let mut sum = 0i64;
        for i in 0..per_channel {
            sum += (values[i * out_channels + channel] - zero_point).abs();
        }
        limit = limit.max(sum);
    }
    Check::new(
        limit <= WEIGHTS_LIMIT,
        format!("Tensor '{}' has the sum of weights: {limit}", weights.name),
    )
}

fn constraint_bias_type(graph: &Graph, op: &Operation) -> Check {
    match op.bias() {
        Some(id) => {
            let bias = graph.tensor(id);
            Check::new(
                matches!(bias.dtype, DataType::Int32 | DataType::Int64),
                format!("Tensor '{}' has data type: {}", bias.name, bias.dtype),
            )
        }
        None => Check::new(true, "Op has no bias tensor"),
    }
}

fn constraint_bias_40bit(graph: &Graph, op: &Operation) -> Check {
    if let Some(id) = op.bias() {
        let bias = graph.tensor(id);
        if bias.dtype == DataType::Int64 {
            if let Some(values) = &bias.quant_values {
                let valid = values.iter().all(|v| v.unsigned_abs() < (1u64 << 40));
                return Check::new(
                    valid,
                    format!("Tensor '{}' has values larger than 40-bits", bias.name),
                );
            }
        }
    }
    Check::new(true, "Op has no bias tensor, or it fits in 40-bit")
}

fn constraint_batch_size(graph: &Graph, op: &Operation) -> Check {
    let Some(id) = op.ifm() else {
        return Check::new(false, "Op has no IFM tensor");
    };
    let ifm = graph.tensor(id);
    let batch = ifm.shape.first().copied().flatten().unwrap_or(0);
    Check::new(
        batch == 1,
        format!("Tensor '{}' has batch size: {batch}", ifm.name),
    )
}

fn constraint_quant_scale_inf(graph: &Graph, op: &Operation) -> Check {
    let scale = |id: Option<TensorId>| {
        id.and_then(|id| graph.tensor(id).quantization.as_ref()?.scale_f32)
    };
    match (scale(op.ifm()), scale(op.ofm())) {
        (Some(ifm_scale), Some(ofm_scale)) => Check::new(
            !(ifm_scale / ofm_scale).is_infinite(),
            format!(
                "Op has infinite quantization scale. ifm_scale={ifm_scale} ofm_scale={ofm_scale}"
            ),
        ),
        _ => Check::new(true, "Op has no quantization scales"),
    }
}

fn constraint_depth_multiplier(graph: &Graph, op: &Operation) -> Check {
    let depth_multiplier = op.attrs.int(Attr::DepthMultiplier).unwrap_or(1);
    if depth_multiplier > 1 {
        let ifm_channels = *dims_of(graph, op.ifm().unwrap()).get(3).unwrap_or(&0);
        let ofm_channels = *dims_of(graph, op.ofm().unwrap()).get(3).unwrap_or(&0);
        let valid = ifm_channels == 1 && ofm_channels == depth_multiplier;
        return Check::new(
            valid,
            format!(
                "Op has ifm_channels={ifm_channels}, ofm_channels={ofm_channels} \
                 and depth_multiplier={depth_multiplier}"
            ),
        );
    }
    Check::new(true, "Op has depth_multiplier=1")
}

fn constraint_tconv_stride(graph: &Graph, op: &Operation) -> Check {
    let kernel = op.kernel(graph);
    Check::new(
        kernel.stride_w == 2 && kernel.stride_h == 2,
        format!(
            "Op has stride WxH as: {}x{}",
            kernel.stride_w, kernel.stride_h
        ),
    )
}

fn constraint_tconv_same(graph: &Graph, op: &Operation) -> Check {
    if op.attrs.padding() == Some(Padding::Same) {
        let kernel = op.kernel(graph);
        let ifm_shape = dims_of(graph, op.ifm().unwrap());
        let ofm_shape = dims_of(graph, op.ofm().unwrap());
        let valid = ofm_shape.get(1) == Some(&(ifm_shape.get(1).unwrap_or(&0) * kernel.stride_h))
            && ofm_shape.get(2) == Some(&(ifm_shape.get(2).unwrap_or(&0) * kernel.stride_w));
        return Check::new(
            valid,
            format!(
                "Op has ifm_shape={ifm_shape:?}, ofm_shape={ofm_shape:?} and stride WxH as {}x{}",
                kernel.stride_w, kernel.stride_h
            ),
        );
    }
    Check::new(true, "Op has padding=VALID")
}

fn constraint_tconv_valid(graph: &Graph, op: &Operation) -> Check {
    if op.attrs.padding() == Some(Padding::Valid) {
        let kernel = op.kernel(graph);
        let ifm_shape = dims_of(graph, op.ifm().unwrap());
        let ofm_shape = dims_of(graph, op.ofm().unwrap());
        let expect = |ifm_dim: i64, stride: i64, k: i64| ifm_dim * stride + (k - stride).max(0);
        let height_check = ofm_shape.get(1).copied()
            == Some(expect(
                ifm_shape.get(1).copied().unwrap_or(0),
                kernel.stride_h,
                kernel.height,
            ));
        let width_check = ofm_shape.get(2).copied()
            == Some(expect(
                ifm_shape.get(2).copied().unwrap_or(0),
                kernel.stride_w,
                kernel.width,
            ));
        return Check::new(
            height_check && width_check,
            format!(
                "Op has ifm_shape={ifm_shape:?}, ofm_shape={ofm_shape:?}, \
                 stride WxH as {}x{} and kernel WxH as {}x{}",
                kernel.stride_w, kernel.stride_h, kernel.width, kernel.height
            ),
        );
    }
    Check::new(true, "Op has padding=SAME")
}

fn constraint_matching_in_out_types(graph: &Graph, op: &Operation) -> Check {
    let ifm_dtype = graph.tensor(op.ifm().unwrap()).dtype;
    let ofm_dtype = graph.tensor(op.ofm().unwrap()).dtype;
    Check::new(
        ifm_dtype == ofm_dtype,
        format!("Op has ifm_dtype={ifm_dtype} and ofm_dtype={ofm_dtype}"),
    )
}

fn constraint_beta_value_range(_graph: &Graph, op: &Operation) -> Check {
    let beta = op.attrs.float(Attr::Beta).unwrap_or(1.0);
    Check::new(beta >= 0.0, format!("Op has beta={beta}"))
}

fn constraint_filter_range(graph: &Graph, op: &Operation) -> Check {
    if op.attrs.padding() == Some(Padding::Same) {
        let kernel = op.kernel(graph);
        let valid = in_range(kernel.width, FILTER_RANGE) && in_range(kernel.height, FILTER_RANGE);
        return Check::new(
            valid,
            format!("Op has kernel filter WxH as: {}x{}", kernel.width, kernel.height),
        );
    }
    Check::new(true, "Op has padding=VALID")
}

fn constraint_filter_height_range(graph: &Graph, op: &Operation) -> Check {
    let height = op.kernel(graph).height;
    Check::new(
        in_range(height, FILTER_HEIGHT_RANGE),
        format!("Op has kernel filter height as: {height}"),
    )
}

fn constraint_filter_product_range(graph: &Graph, op: &Operation) -> Check {
    let product = op.kernel(graph).elements_wh();
    Check::new(
        in_range(product, FILTER_PRODUCT_RANGE),
        format!("Op has product of kernel filter width and height as: {product}"),
    )
}

fn constraint_filter_height_range_valid_pad(graph: &Graph, op: &Operation) -> Check {
    if op.attrs.padding() == Some(Padding::Valid) {
        return constraint_filter_height_range(graph, op);
    }
    Check::new(true, "Op has padding=SAME")
}

fn constraint_filter_product_range_valid_pad(graph: &Graph, op: &Operation) -> Check {
    if op.attrs.padding() == Some(Padding::Valid) {
        return constraint_filter_product_range(graph, op);
    }
    Check::new(true, "Op has padding=SAME")
}

fn constraint_resize(graph: &Graph, op: &Operation) -> Check {
    let ifm_shape = dims_of(graph, op.ifm().unwrap());
    let ofm_shape = dims_of(graph, op.ofm().unwrap());
    let align_corners = op.attrs.boolean(Attr::AlignCorners).unwrap_or(false);
    let mut valid = false;
    if ifm_shape.len() == 4 {
        if (ifm_shape[1] == 1 && ifm_shape[2] == 1) || ifm_shape == ofm_shape {
            valid = true;
        } else {
            // Repeated 2x upscaling, dropping one row/column per step when
            // corners are aligned.
            let mut upscaled = [ifm_shape[1], ifm_shape[2]];
            let out = [ofm_shape[1], ofm_shape[2]];
            while upscaled[0] < out[0] && upscaled[1] < out[1] {
                upscaled = upscaled.map(|d| d * 2);
                if align_corners {
                    upscaled = upscaled.map(|d| d - 1);
                }
                if upscaled == out {
                    valid = true;
                    break;
                }
            }
        }
    }
    Check::new(
        valid,
        format!(
            "Op has ifm_shape={ifm_shape:?}, ofm_shape={ofm_shape:?} \
             and align_corners={align_corners}"
        ),
    )
}

fn constraint_matching_shapes(graph: &Graph, op: &Operation) -> Check {
    let ifm_shape = dims_of(graph, op.ifm().unwrap());
    let ofm_shape = dims_of(graph, op.ofm().unwrap());
    Check::new(
        ifm_shape == ofm_shape,
        format!("Op has ifm_shape={ifm_shape:?} and ofm_shape={ofm_shape:?}"),
    )
}

fn constraint_splitv_inferred(graph: &Graph, op: &Operation) -> Check {
    let sizes = op
        .ifm2()
        .and_then(|id| graph.tensor(id).values.clone())
        .unwrap_or_default();
    let inferred = sizes.iter().filter(|&&v| v == -1).count();
    Check::new(
        inferred <= 1,
        format!("Op has multiple inferred sizes (-1): {sizes:?}"),
    )
}

fn constraint_axis_exists(_graph: &Graph, op: &Operation) -> Check {
    let axis = op.attrs.int(Attr::Axis);
    Check::new(axis.is_some(), format!("Op has axis={axis:?}"))
}

fn constraint_axis_valid(graph: &Graph, op: &Operation) -> Check {
    let dims = graph.tensor(op.ofm().unwrap()).rank() as i64;
    let mut axis = op.attrs.int(Attr::Axis).unwrap_or(0);
    if axis < 0 {
        axis += dims;
    }
    Check::new(
        0 <= axis && axis < dims,
        format!("Op has ofm_dimensions={dims} and axis attribute is: {axis}"),
    )
}

fn constraint_matching_dimensionality(graph: &Graph, op: &Operation) -> Check {
    let ofm_dim = graph.tensor(op.ofm().unwrap()).rank();
    let mut offenders = Vec::new();
    for &id in &op.inputs {
        let tens = graph.tensor(id);
        if tens.rank() != ofm_dim {
            offenders.push(format!("Tensor '{}' has dimension: {}", tens.name, tens.rank()));
        }
    }
    Check::new(
        offenders.is_empty(),
        format!(
            "Op has ofm_dimension={ofm_dim} and the list of mismatching inputs are: {}",
            offenders.join(", ")
        ),
    )
}

fn constraint_valid_dimensions(graph: &Graph, op: &Operation) -> Check {
    let ofm_shape = dims_of(graph, op.ofm().unwrap());
    let ofm_dim = ofm_shape.len() as i64;
    let mut axis = op.attrs.int(Attr::Axis).unwrap_or(0);
    if axis < 0 {
        axis += ofm_dim;
    }
    let mut offenders = Vec::new();
    for &id in &op.inputs {
        let tens = graph.tensor(id);
        let shape = dims_of(graph, id);
        let mismatch = (0..ofm_shape.len())
            .filter(|&dim| dim as i64 != axis)
            .any(|dim| shape.get(dim) != Some(&ofm_shape[dim]));
        if mismatch {
            offenders.push(format!(
                "Tensor '{}' has shape: {}",
                tens.name,
                format_shape(&tens.shape)
            ));
        }
    }
    Check::new(
        offenders.is_empty(),
        format!(
            "Op has axis={axis}, ofm_shape={ofm_shape:?} \
             and the list of mismatching inputs are: {}",
            offenders.join(", ")
        ),
    )
}

fn constraint_stridedslice_input_count(_graph: &Graph, op: &Operation) -> Check {
    let inputs = op.inputs.len();
    Check::new(inputs == 4, format!("Op has {inputs} inputs"))
}

fn constraint_stridedslice_inputs_const(graph: &Graph, op: &Operation) -> Check {
    let mut offenders = Vec::new();
    for (index, label) in [(1, "Begin"), (2, "End"), (3, "Stride")] {
        if let Some(&id) = op.inputs.get(index) {
            let tens = graph.tensor(id);
            if tens.values.is_none() {
                offenders.push(format!("{label} tensor '{}'", tens.name));
            }
        }
    }
    Check::new(
        offenders.is_empty(),
        format!("Op has non-constant tensors: {}", offenders.join(", ")),
    )
}

fn constraint_stridedslice_stride_values(graph: &Graph, op: &Operation) -> Check {
    let strides = op
        .inputs
        .get(3)
        .and_then(|&id| graph.tensor(id).values.clone())
        .unwrap_or_default();
    Check::new(
        strides.iter().all(|&s| s == 1),
        format!("Op has strides values {strides:?}"),
    )
}

fn constraint_ellipsis_mask(_graph: &Graph, op: &Operation) -> Check {
    let ellipsis = op.attrs.int(Attr::EllipsisMask).unwrap_or(0);
    Check::new(ellipsis == 0, format!("Op has ellipsis mask as: {ellipsis}"))
}

fn constraint_axis_masks(_graph: &Graph, op: &Operation) -> Check {
    let new_axis = op.attrs.int(Attr::NewAxisMask).unwrap_or(0);
    let shrink_axis = op.attrs.int(Attr::ShrinkAxisMask).unwrap_or(0);
    Check::new(
        new_axis == 0 || shrink_axis == 0,
        format!("Op has new_axis_mask={new_axis} and shrink_axis_mask={shrink_axis}"),
    )
}

/// Resolves the begin or end offsets of a strided slice: masked axes take
/// the start or the full extent, negative values count from the end, and
/// everything is clamped to the input extent.
fn slice_offsets(shape: &[i64], values: &[i64], mask: i64, is_begin: bool) -> Vec<i64> {
    shape
        .iter()
        .enumerate()
        .map(|(axis, &dim)| {
            if mask & (1 << axis) != 0 {
                if is_begin {
                    0
                } else {
                    dim
                }
            } else {
                let mut value = values.get(axis).copied().unwrap_or(0);
                if value < 0 {
                    value += dim;
                }
                value.clamp(0, dim)
            }
        })
        .collect()
}

fn constraint_slice_ranges(graph: &Graph, op: &Operation) -> Check {
    let ifm_shape = dims_of(graph, op.inputs[0]);
    let begin_values = graph.tensor(op.inputs[1]).values.clone().unwrap_or_default();
    let end_values = graph.tensor(op.inputs[2]).values.clone().unwrap_or_default();
    let begin_mask = op.attrs.int(Attr::BeginMask).unwrap_or(0);
    let end_mask = op.attrs.int(Attr::EndMask).unwrap_or(0);
    let offset_begin = slice_offsets(&ifm_shape, &begin_values, begin_mask, true);
    let offset_end = slice_offsets(&ifm_shape, &end_values, end_mask, false);
    let valid = offset_begin
        .iter()
        .zip(&offset_end)
        .all(|(begin, end)| end - begin > 0);
    Check::new(
        valid,
        format!("Op has begin_values={begin_values:?} and end_values={end_values:?}"),
    )
}

fn constraint_matching_inputs_types(graph: &Graph, op: &Operation) -> Check {
    let ifm_dtype = graph.tensor(op.ifm().unwrap()).dtype;
    let ifm2_dtype = graph.tensor(op.ifm2().unwrap()).dtype;
    Check::new(
        ifm_dtype == ifm2_dtype,
        format!("Op has ifm_dtype={ifm_dtype} and ifm2_dtype={ifm2_dtype}"),
    )
}

fn constraint_matching_signed(graph: &Graph, op: &Operation) -> Check {
    let ifm_dtype = graph.tensor(op.ifm().unwrap()).dtype;
    let ofm_dtype = graph.tensor(op.ofm().unwrap()).dtype;
    let valid = !ifm_dtype.is_signed() || ofm_dtype.is_signed();
    Check::new(
        valid,
        format!("Op has ifm_dtype={ifm_dtype} and ofm_dtype={ofm_dtype}"),
    )
}

fn constraint_unsigned_valid(graph: &Graph, op: &Operation) -> Check {
    let ifm_dtype = graph.tensor(op.ifm().unwrap()).dtype;
    let ofm_dtype = graph.tensor(op.ofm().unwrap()).dtype;
    let valid =
        ifm_dtype.is_signed() || ofm_dtype == ifm_dtype || ofm_dtype == DataType::Int32;
    Check::new(
        valid,
        format!("Op has ifm_dtype={ifm_dtype} and ofm_dtype={ofm_dtype}"),
    )
}

fn constraint_inputs_int32(graph: &Graph, op: &Operation) -> Check {
    let ifm_dtype = graph.tensor(op.ifm().unwrap()).dtype;
    let ifm2_dtype = graph.tensor(op.ifm2().unwrap()).dtype;
    Check::new(
        ifm_dtype == DataType::Int32 && ifm2_dtype == DataType::Int32,
        format!("Op has ifm_dtype={ifm_dtype} and ifm2_dtype={ifm2_dtype}"),
    )
}

fn constraint_output_int32(graph: &Graph, op: &Operation) -> Check {
    let ofm_dtype = graph.tensor(op.ofm().unwrap()).dtype;
    Check::new(
        ofm_dtype == DataType::Int32,
        format!("Op has ofm_dtype={ofm_dtype}"),
    )
}

fn constraint_matching_quantization_parameters(graph: &Graph, op: &Operation) -> Check {
    let ofm = graph.tensor(op.ofm().unwrap());
    let mut offenders = Vec::new();
    for id in [op.ifm(), op.ifm2()].into_iter().flatten() {
        let tens = graph.tensor(id);
        let equal = match (&ofm.quantization, &tens.quantization) {
            (Some(a), Some(b)) => a.scaling_equal(b),
            _ => false,
        };
        if !equal {
            offenders.push(tens.name.clone());
        }
    }
    Check::new(
        offenders.is_empty(),
        format!(
            "Op has tensors with different quantization parameters to the OFM '{}': {}",
            ofm.name,
            offenders.join(", ")
        ),
    )
}

fn constraint_elemwise_batch_size(graph: &Graph, op: &Operation) -> Check {
    let mut offenders = Vec::new();
    for id in [op.ifm(), op.ifm2()].into_iter().flatten() {
        let tens = graph.tensor(id);
        if tens.rank() > 2 && tens.shape.first().copied().flatten() != Some(1) {
            offenders.push(tens.name.clone());
        }
    }
    Check::new(
        offenders.is_empty(),
        format!("Op has invalid input tensors: {}", offenders.join(", ")),
    )
}

fn constraint_matching_either_shapes(graph: &Graph, op: &Operation) -> Check {
    let ifm_shape = dims_of(graph, op.ifm().unwrap());
    let ifm2_shape = op.ifm2().map(|id| dims_of(graph, id));
    let ofm_shape = dims_of(graph, op.ofm().unwrap());
    let valid = ifm_shape == ofm_shape || ifm2_shape.as_ref() == Some(&ofm_shape);
    Check::new(
        valid,
        format!(
            "Op has ifm_shape={ifm_shape:?}, ifm2_shape={ifm2_shape:?} \
             and ofm_shape={ofm_shape:?}"
        ),
    )
}

fn constraint_broadcast_shapes(graph: &Graph, op: &Operation) -> Check {
    let ifm_shape = dims_of(graph, op.ifm().unwrap());
    let ifm2_shape = op.ifm2().map(|id| dims_of(graph, id));
    let mut valid = true;
    if let Some(ifm2_shape) = &ifm2_shape {
        let ofm_shape = dims_of(graph, op.ofm().unwrap());
        // Align trailing dimensions; broadcasting is only allowed along
        // rank indices where one input is 1, and the output takes the
        // larger extent.
        let size = ifm_shape.len().min(ifm2_shape.len());
        let trailing = |shape: &[i64]| shape[shape.len() - size..].to_vec();
        for ((i, i2), o) in trailing(&ifm_shape)
            .into_iter()
            .zip(trailing(ifm2_shape))
            .zip(trailing(&ofm_shape))
        {
            let largest = i.max(i2);
            if !(i == i2 || i == 1 || i2 == 1) || o != largest {
                valid = false;
                break;
            }
        }
    }
    Check::new(
        valid,
        format!("Op has ifm_shape={ifm_shape:?} and ifm2_shape={ifm2_shape:?}"),
    )
}

fn constraint_alpha_valid(_graph: &Graph, op: &Operation) -> Check {
    let alpha = op.attrs.float(Attr::Alpha);
    match alpha {
        Some(alpha) => Check::new(alpha >= 0.0, format!("Op has alpha={alpha}")),
        None => Check::new(false, "Op has no alpha attribute"),
    }
}

/// The collection of all supported operators and their parameter checks.
pub struct SupportedOperators {
    generic_constraints: Vec<Constraint>,
    specific_constraints: HashMap<OpKind, Vec<Constraint>>,
}

impl Default for SupportedOperators {
    fn default() -> Self {
        SupportedOperators::new()
    }
}

impl SupportedOperators {
    /// Builds the constraint registry. The order of the generic constraints
    /// matters: later constraints may assume the earlier ones held.
    pub fn new() -> Self {
        let generic_constraints = vec![
            Constraint::new(
                "Input(s) and Output tensors must not be dynamic",
                constraint_tens_no_dynamic,
            ),
            Constraint::new(
                "Input(s) and Output tensors must have a defined shape",
                constraint_tens_defined_shape,
            ),
            Constraint::new("Output tensors cannot be scalar", constraint_tens_output_scalar),
            Constraint::new(
                "Scalar Input tensors are only valid for op type: \
                 ADD, MAXIMUM, MINIMUM, MUL, SPLIT, SPLIT_V, SUB",
                constraint_tens_input_scalar,
            ),
            Constraint::new(
                "Input(s) and Output tensors must not be greater than 4D",
                constraint_tens_shape_size,
            ),
            Constraint::new(
                "Tensors must be of type: uint8, int8, int16, int32",
                constraint_tens_dtype,
            ),
            Constraint::new(
                "Tensors which are int32 are only valid when op type is: ADD, MUL, SUB, SUM",
                constraint_tens_int32_ops,
            ),
            Constraint::new(
                "Tensor dimensions must be in the range [1, 65535]",
                constraint_tens_dimension,
            ),
            Constraint::new(
                "Input(s), Output and Weight tensors must have quantization parameters",
                constraint_tens_quant_none_check,
            ),
            Constraint::new(
                "Input(s), Output and Weight tensors with quantization scales must be finite",
                constraint_tens_quant_scale,
            ),
            Constraint::new(
                "Per-axis quantization is only supported for the following op types: \
                 CONV_2D, DEPTHWISE_CONV_2D, TRANSPOSE_CONV",
                constraint_tens_quant_per_axis,
            ),
            Constraint::new(
                "The fused activation function (if present) must be one of type: \
                 LOGISTIC, RELU, RELU6, RELU_N1_TO_1, TANH",
                constraint_faf,
            ),
        ];

        let mut specific: HashMap<OpKind, Vec<Constraint>> = HashMap::new();
        let mut add = |kind: OpKind, doc: &'static str, check: ConstraintFn| {
            specific
                .entry(kind)
                .or_default()
                .push(Constraint::new(doc, check));
        };

        let all_kinds = [
            OpKind::Conv2D,
            OpKind::Conv2DBias,
            OpKind::QuantizedConv2D,
            OpKind::DepthwiseConv2DBias,
            OpKind::Conv2DBackpropInput,
            OpKind::MatMul,
            OpKind::QuantizedMatMul,
            OpKind::FullyConnected,
            OpKind::BlockLstm,
            OpKind::AvgPool,
            OpKind::MaxPool,
            OpKind::QuantizedAvgPool,
            OpKind::QuantizedMaxPool,
            OpKind::ReduceSum,
            OpKind::ResizeBilinear,
            OpKind::Add,
            OpKind::Sub,
            OpKind::Mul,
            OpKind::Minimum,
            OpKind::Maximum,
            OpKind::Shl,
            OpKind::Shr,
            OpKind::Clz,
            OpKind::Abs,
            OpKind::LeakyRelu,
            OpKind::Relu,
            OpKind::Relu6,
            OpKind::ReluN1To1,
            OpKind::Softmax,
            OpKind::Concat,
            OpKind::SplitV,
            OpKind::StridedSlice,
        ];

        for kind in all_kinds {
            if kind.is_convolution_like() {
                add(kind, "Stride values for both width and height must be in the range [1, 3]", constraint_stride_range);
                add(kind, "Dilation factor values for both width and height must be in the range [1, 2]", constraint_dilation_range);
                add(kind, "Dilated kernel height must be in the range [1, 64]", constraint_dilated_height_range);
                add(kind, "Product of dilated kernel width and height must be in the range [1, 4096]", constraint_dilated_product_range);
                add(kind, "Weight tensor must be 8-bit", constraint_weights_type);
                add(kind, "Weight tensor must be constant", constraint_weights_const);
                add(kind, "The sum of the weights cannot exceed 8323072", constraint_weights_limit);
                add(kind, "Optional Bias tensor must be of type: int32, int64", constraint_bias_type);
                add(kind, "Optional Bias tensor values must fit within 40-bits", constraint_bias_40bit);
                add(kind, "IFM Tensor batch size must be 1", constraint_batch_size);
            }
            if kind.is_depthwise_convolution() {
                add(kind, "For depth multipliers > 1, IFM channels must be 1 and OFM channels must be equal to the depth multiplier", constraint_depth_multiplier);
            }
            if kind.is_transpose_convolution() {
                add(kind, "Stride values for both width and height must be 2", constraint_tconv_stride);
                add(kind, "SAME padding: OFM dimensions must equal IFM dimensions multiplied by stride", constraint_tconv_same);
                add(kind, "VALID padding: OFM dimensions must equal IFM dimensions multiplied by stride, minus difference between kernel size and stride", constraint_tconv_valid);
            }
            if kind.is_pooling() {
                add(kind, "IFM Tensor batch size must be 1", constraint_batch_size);
                add(kind, "Stride values for both width and height must be in the range [1, 3]", constraint_stride_range);
            }
            if kind.is_avg_pool() {
                add(kind, "IFM and OFM data types must match", constraint_matching_in_out_types);
                add(kind, "SAME padding: Kernel filter values for both width and height must be in the range [1, 8]", constraint_filter_range);
                add(kind, "VALID padding: Kernel filter height must be in the range [1, 256]", constraint_filter_height_range_valid_pad);
                add(kind, "VALID padding: Product of kernel filter width and height must be in the range [1, 65536]", constraint_filter_product_range_valid_pad);
            }
            if kind.is_max_pool() {
                add(kind, "IFM and OFM data types must match", constraint_matching_in_out_types);
                add(kind, "Kernel filter height must be in the range [1, 256]", constraint_filter_height_range);
                add(kind, "Product of kernel filter width and height must be in the range [1, 65536]", constraint_filter_product_range);
            }
            if kind.is_relu() {
                add(kind, "The IFM quantization scale divided by the OFM quantization scale must not be infinite", constraint_quant_scale_inf);
            }
            if kind.is_resize() {
                add(kind, "The width and height of the IFM and OFM must match one of the following criteria: IFM W and H must both be 1; IFM must match OFM; OFM W and H must be 2x IFM -1, if align_corners is True; OFM W and H must be 2x IFM, if align_corners is False", constraint_resize);
            }
            if kind.is_vector_product() {
                add(kind, "Weight tensor must be 8-bit", constraint_weights_type);
                add(kind, "Weight tensor must be constant", constraint_weights_const);
                add(kind, "Optional Bias tensor must be of type: int32, int64", constraint_bias_type);
                add(kind, "Optional Bias tensor values must fit within 40-bits", constraint_bias_40bit);
            }
            if kind.is_elementwise_main() {
                add(kind, "Batch size must be 1 for Input tensors with more than 2 dimensions", constraint_elemwise_batch_size);
                add(kind, "At least one Input's shape must match the OFM's shape", constraint_matching_either_shapes);
            }
            if kind.is_unary_elementwise() {
                add(kind, "IFM and OFM data types must match", constraint_matching_in_out_types);
            }
            if kind.is_binary_min_max() {
                add(kind, "IFM and OFM data types must match", constraint_matching_in_out_types);
                add(kind, "Both Input quantization parameters must match OFM quantization parameters", constraint_matching_quantization_parameters);
                add(kind, "Broadcasting is only allowed for rank indices with dimension 1, from either IFM1 or IFM2", constraint_broadcast_shapes);
            }
            if kind.is_binary_add_mul_sub() {
                add(kind, "Both Input data types must match", constraint_matching_inputs_types);
                add(kind, "For IFM that are signed, OFM must also be signed", constraint_matching_signed);
                add(kind, "For IFM that are unsigned, OFM must either be the same type or int32", constraint_unsigned_valid);
                add(kind, "Broadcasting is only allowed for rank indices with dimension 1, from either IFM1 or IFM2", constraint_broadcast_shapes);
            }
            if kind.is_binary_shift() {
                add(kind, "Both Input data types must be int32", constraint_inputs_int32);
                add(kind, "Broadcasting is only allowed for rank indices with dimension 1, from either IFM1 or IFM2", constraint_broadcast_shapes);
            }
        }

        add(OpKind::Shl, "OFM must be int32", constraint_output_int32);
        add(OpKind::Clz, "OFM must be int32", constraint_output_int32);

        add(OpKind::Softmax, "IFM and OFM shapes must match", constraint_matching_shapes);
        add(OpKind::Softmax, "IFM and OFM data types must match", constraint_matching_in_out_types);
        add(OpKind::Softmax, "Beta value needs to be positive", constraint_beta_value_range);

        add(OpKind::SplitV, "Only one size is allowed to be inferred", constraint_splitv_inferred);

        add(OpKind::Concat, "Axis attribute must exist", constraint_axis_exists);
        add(OpKind::Concat, "Axis attribute must be in the range [0, <ofm_dimensions>)", constraint_axis_valid);
        add(OpKind::Concat, "All Input dimensionalities must match OFM dimensionality", constraint_matching_dimensionality);
        add(OpKind::Concat, "All Input dimensions must match OFM dimension in all axes except the one defined by the axis attribute", constraint_valid_dimensions);

        add(OpKind::StridedSlice, "Exactly 4 Input tensors are required", constraint_stridedslice_input_count);
        add(OpKind::StridedSlice, "Begin, End and Stride Input tensors must be constant", constraint_stridedslice_inputs_const);
        add(OpKind::StridedSlice, "All Strides values must be 1", constraint_stridedslice_stride_values);
        add(OpKind::StridedSlice, "ellipsis_mask must be 0", constraint_ellipsis_mask);
        add(OpKind::StridedSlice, "new_axis_mask and shrink_axis_mask cannot both be set", constraint_axis_masks);
        add(OpKind::StridedSlice, "Slice 'end' values must be greater than 'begin' values", constraint_slice_ranges);

        add(OpKind::LeakyRelu, "Alpha must not be negative", constraint_alpha_valid);

        SupportedOperators {
            generic_constraints,
            specific_constraints: specific,
        }
    }

    /// Decides whether the operator can run on the NPU. A rejection is
    /// reported to stderr: first the warning naming the operator, then the
    /// violated rule, then the offending detail.
    pub fn is_operator_supported(&self, graph: &Graph, op_id: OpId) -> bool {
        let op = graph.op(op_id);
        let ext_type = op.kind.external_name();
        if !is_supported_operator(op.kind) {
            if !op.kind.is_startup_init() {
                eprintln!("Info: {ext_type} '{}' is a CPU only op", op.name);
            }
            return false;
        }

        let specific = self.specific_constraints.get(&op.kind);
        for constraint in self
            .generic_constraints
            .iter()
            .chain(specific.into_iter().flatten())
        {
            let result = constraint.check(graph, op);
            if !result.valid {
                eprintln!(
                    "Warning: {ext_type} '{}' is not supported on the NPU. \
                     Placing on CPU instead",
                    op.name
                );
                eprintln!(" - {}", constraint.doc);
                if !result.extra.is_empty() {
                    eprintln!("   {}", result.extra);
                }
                return false;
            }
        }
        true
    }

    /// The generic constraints, in evaluation order.
    pub fn generic_constraints(&self) -> &[Constraint] {
        &self.generic_constraints
    }

    /// The specific constraints of one operator kind, in evaluation order.
    pub fn specific_constraints(&self, kind: OpKind) -> &[Constraint] {
        self.specific_constraints
            .get(&kind)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Runs the checker over every operator and records the verdict in
/// [`Operation::run_on_npu`]. The pass packer's NPU rows only accept marked
/// operators.
pub fn annotate_graph(graph: &mut Graph, support: &SupportedOperators) {
    for op_id in graph.op_ids().collect::<Vec<_>>() {
        let supported = support.is_operator_supported(graph, op_id);
        graph.op_mut(op_id).run_on_npu = supported;
    }
}
