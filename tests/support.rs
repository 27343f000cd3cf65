//! Tests for the operator legality checker.


use enpu::graph::{
    ActivationFunction, Attr, AttrValue, Graph, OpId, Operation, QuantizationParameters, Tensor,
    ZeroPoint,
};
use enpu::{DataType, OpKind, Padding, SupportedOperators};
use util::*;

fn support() -> SupportedOperators {
    SupportedOperators::new()
}

fn set_stride(graph: &mut Graph, op: OpId, w: i64, h: i64) {
    let attrs = &mut graph.op_mut(op).attrs;
    attrs.set(Attr::StrideW, AttrValue::Int(w));
    attrs.set(Attr::StrideH, AttrValue::Int(h));
}

fn set_filter(graph: &mut Graph, op: OpId, w: i64, h: i64) {
    let attrs = &mut graph.op_mut(op).attrs;
    attrs.set(Attr::FilterWidth, AttrValue::Int(w));
    attrs.set(Attr::FilterHeight, AttrValue::Int(h));
}

fn set_padding(graph: &mut Graph, op: OpId, padding: Padding) {
    graph
        .op_mut(op)
        .attrs
        .set(Attr::Padding, AttrValue::Padding(padding));
}

#[test]
fn constraint_tens_no_dynamic() {
    // A scalar output without values is a dynamic tensor
    let mut graph = Graph::new();
    let op = create_op_with_quant_tensors(&mut graph, OpKind::Relu, &[1, 8, 8, 8], &[]);
    assert!(!support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_tens_defined_shape() {
    let mut graph = Graph::new();
    let ifm = graph.add_tensor({
        let mut tens = Tensor::with_dims(
            vec![Some(1), Some(8), None, Some(8)],
            DataType::UInt8,
            "in",
        );
        tens.quantization = Some(default_quant());
        tens
    });
    let ofm = feature_tensor(&mut graph, &[1, 8, 8, 8], DataType::UInt8, "out");
    let op = graph.add_op(Operation {
        inputs: vec![ifm],
        outputs: vec![ofm],
        ..Operation::new(OpKind::Relu, "relu")
    });
    assert!(!support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_tens_output_scalar() {
    // Scalar output is not allowed at all
    let mut graph = Graph::new();
    let op = create_elemwise_op(&mut graph, OpKind::Mul, "op", &[1, 8, 8, 8], Some(&[1, 8, 8, 8]), &[]);
    let ofm = graph.op(op).ofm().unwrap();
    graph.tensor_mut(ofm).values = Some(vec![0]);
    assert!(!support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_tens_input_scalar() {
    // Shapeless input is allowed if it is of a certain op type
    let mut graph = Graph::new();
    let op = create_elemwise_op(&mut graph, OpKind::Mul, "op", &[1, 8, 8, 8], Some(&[]), &[1, 8, 8, 8]);
    assert!(support().is_operator_supported(&graph, op));
    // Invalid shapeless input due to op type
    let op = create_op_with_quant_tensors(&mut graph, OpKind::Relu, &[], &[1, 8, 8, 8]);
    let ifm = graph.op(op).ifm().unwrap();
    graph.tensor_mut(ifm).values = Some(vec![0]);
    assert!(!support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_tens_shape_size() {
    // Tensors cannot be > 4D
    let mut graph = Graph::new();
    let op =
        create_op_with_quant_tensors(&mut graph, OpKind::Relu, &[1, 1, 8, 8, 8], &[1, 1, 8, 8, 8]);
    assert!(!support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_tens_dtype() {
    let mut graph = Graph::new();
    let op = create_op_with_quant_tensors_dtype(
        &mut graph,
        OpKind::Relu,
        &[1, 8, 8, 8],
        &[1, 8, 8, 8],
        DataType::Float32,
    );
    assert!(!support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_tens_int32_ops() {
    // For int32, only select op types are allowed
    let mut graph = Graph::new();
    let op = create_elemwise_op_dtype(
        &mut graph,
        OpKind::Mul,
        "op",
        &[1, 8, 8, 8],
        Some(&[]),
        &[1, 8, 8, 8],
        DataType::Int32,
    );
    assert!(support().is_operator_supported(&graph, op));
    let op = create_op_with_quant_tensors_dtype(
        &mut graph,
        OpKind::Relu,
        &[1, 8, 8, 8],
        &[1, 8, 8, 8],
        DataType::Int32,
    );
    assert!(!support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_tens_dimension() {
    // Dimensions must lie in [1, 65535]
    let mut graph = Graph::new();
    let op =
        create_op_with_quant_tensors(&mut graph, OpKind::Relu, &[1, 8, 8, 0], &[1, 8, 8, 65536]);
    assert!(!support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_tens_quant_none_check() {
    let mut graph = Graph::new();
    let op = create_elemwise_op(&mut graph, OpKind::Mul, "op", &[1, 8, 8, 8], Some(&[]), &[1, 8, 8, 8]);
    let ifm2 = graph.op(op).ifm2().unwrap();
    graph.tensor_mut(ifm2).quantization = None;
    assert!(!support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_tens_quant_scale() {
    let mut graph = Graph::new();
    let op = create_elemwise_op(&mut graph, OpKind::Mul, "op", &[1, 8, 8, 8], Some(&[]), &[1, 8, 8, 8]);
    let ifm = graph.op(op).ifm().unwrap();
    graph.tensor_mut(ifm).quantization = Some(QuantizationParameters {
        scale_f32: Some(f32::INFINITY),
        ..Default::default()
    });
    assert!(!support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_tens_quant_per_axis_not_supp() {
    // Per-axis quantization is not supported for elementwise ops
    let mut graph = Graph::new();
    let op = create_elemwise_op(&mut graph, OpKind::Mul, "op", &[1, 8, 8, 8], Some(&[]), &[1, 8, 8, 8]);
    let ifm = graph.op(op).ifm().unwrap();
    graph.tensor_mut(ifm).quantization = Some(QuantizationParameters {
        zero_point: ZeroPoint::PerAxis(vec![0, 0, 0]),
        ..Default::default()
    });
    assert!(!support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_tens_quant_per_axis_is_supp() {
    let mut graph = Graph::new();
    let op = create_op_with_quant_tensors(&mut graph, OpKind::Conv2DBias, &[1, 1, 1, 3], &[1, 1, 1, 3]);
    add_weights(&mut graph, op, &[1, 1, 1, 3]);
    let bias = add_bias(&mut graph, op, &[1, 1, 1, 3], DataType::Int32);
    set_stride(&mut graph, op, 1, 1);
    assert!(support().is_operator_supported(&graph, op));
    graph.tensor_mut(bias).quantization = Some(QuantizationParameters {
        zero_point: ZeroPoint::PerAxis(vec![0, 0, 0]),
        ..Default::default()
    });
    assert!(support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_faf() {
    // Fused activation functions, if set, must be a valid op type
    let mut graph = Graph::new();
    let op = create_op_with_quant_tensors(&mut graph, OpKind::Relu, &[1, 8, 8, 8], &[1, 8, 8, 8]);
    graph.op_mut(op).activation = Some(ActivationFunction::new(OpKind::Conv2D));
    assert!(!support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_conv_pass() {
    // First test a simple conv passes
    let mut graph = Graph::new();
    let op = create_op_with_quant_tensors(&mut graph, OpKind::Conv2D, &[1, 1, 1, 1], &[1, 1, 1, 1]);
    add_weights(&mut graph, op, &[1, 1, 1, 1]);
    set_stride(&mut graph, op, 1, 1);
    assert!(support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_stride_range() {
    let mut graph = Graph::new();
    let op = create_op_with_quant_tensors(&mut graph, OpKind::Conv2D, &[1, 8, 8, 8], &[1, 8, 8, 8]);
    add_weights(&mut graph, op, &[1, 1, 1, 1]);
    set_stride(&mut graph, op, 0, 20);
    assert!(!support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_dilation_range() {
    let mut graph = Graph::new();
    let op = create_op_with_quant_tensors(&mut graph, OpKind::Conv2D, &[1, 8, 8, 8], &[1, 8, 8, 8]);
    add_weights(&mut graph, op, &[1, 1, 1, 1]);
    set_stride(&mut graph, op, 1, 1);
    let attrs = &mut graph.op_mut(op).attrs;
    attrs.set(Attr::DilationWFactor, AttrValue::Int(0));
    attrs.set(Attr::DilationHFactor, AttrValue::Int(20));
    assert!(!support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_dilated_height_range() {
    let mut graph = Graph::new();
    let op = create_op_with_quant_tensors(&mut graph, OpKind::Conv2D, &[1, 8, 8, 8], &[1, 8, 8, 8]);
    add_weights(&mut graph, op, &[65, 64, 1, 1]);
    set_stride(&mut graph, op, 1, 1);
    assert!(!support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_dilated_product_range() {
    let mut graph = Graph::new();
    let op = create_op_with_quant_tensors(&mut graph, OpKind::Conv2D, &[1, 8, 8, 8], &[1, 8, 8, 8]);
    add_weights(&mut graph, op, &[64, 65, 1, 1]);
    set_stride(&mut graph, op, 1, 1);
    assert!(!support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_weights_type() {
    // Weight tensor must be 8-bit
    let mut graph = Graph::new();
    let op = create_op_with_quant_tensors_dtype(
        &mut graph,
        OpKind::Conv2D,
        &[1, 8, 8, 8],
        &[1, 8, 8, 8],
        DataType::Int16,
    );
    add_weights_dtype(&mut graph, op, &[1, 1, 1, 1], DataType::Int16);
    set_stride(&mut graph, op, 1, 1);
    assert!(!support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_weights_const() {
    // Weight tensor cannot be non-const
    let mut graph = Graph::new();
    let op = create_op_with_quant_tensors(&mut graph, OpKind::Conv2D, &[1, 8, 8, 8], &[1, 8, 8, 8]);
    set_stride(&mut graph, op, 1, 1);
    let weights = add_weights(&mut graph, op, &[64, 64, 1, 1]);
    graph.tensor_mut(weights).values = None;
    graph.tensor_mut(weights).quant_values = None;
    assert!(!support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_weights_limit() {
    // Sum of weights has a limit
    let mut graph = Graph::new();
    let op = create_op_with_quant_tensors(&mut graph, OpKind::Conv2D, &[1, 8, 8, 8], &[1, 8, 8, 8]);
    let weights = add_weights(&mut graph, op, &[1, 1, 1, 1]);
    set_stride(&mut graph, op, 1, 1);
    graph.tensor_mut(weights).quantization = Some(QuantizationParameters {
        zero_point: ZeroPoint::Scalar(127 * 65536 + 1),
        ..Default::default()
    });
    assert!(!support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_bias_type() {
    // Bias must have a certain datatype
    let mut graph = Graph::new();
    let op = create_op_with_quant_tensors(&mut graph, OpKind::Conv2DBias, &[1, 8, 8, 8], &[1, 8, 8, 8]);
    add_weights(&mut graph, op, &[1, 1, 1, 1]);
    set_stride(&mut graph, op, 1, 1);
    add_bias(&mut graph, op, &[1, 8, 8, 8], DataType::UInt8);
    assert!(!support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_bias_40bit() {
    // Bias must not exceed 40 bits
    let mut graph = Graph::new();
    let op = create_op_with_quant_tensors(&mut graph, OpKind::Conv2DBias, &[1, 1, 1, 1], &[1, 1, 1, 1]);
    add_weights(&mut graph, op, &[1, 1, 1, 1]);
    set_stride(&mut graph, op, 1, 1);
    let bias = add_bias(&mut graph, op, &[1, 1, 1, 1], DataType::Int64);
    graph.tensor_mut(bias).quant_values = Some(vec![0x01FF_FFFF_FFFF]);
    assert!(!support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_batch_size() {
    let mut graph = Graph::new();
    let op = create_op_with_quant_tensors(&mut graph, OpKind::Conv2D, &[2, 8, 8, 8], &[1, 8, 8, 8]);
    add_weights(&mut graph, op, &[1, 1, 1, 1]);
    set_stride(&mut graph, op, 1, 1);
    assert!(!support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_quant_scale_inf() {
    let mut graph = Graph::new();
    let op = create_op_with_quant_tensors(&mut graph, OpKind::Relu, &[1, 8, 8, 8], &[1, 8, 8, 8]);
    let ofm = graph.op(op).ofm().unwrap();
    graph.tensor_mut(ofm).quantization = Some(QuantizationParameters {
        scale_f32: Some(1e-39),
        ..Default::default()
    });
    assert!(!support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_depth_multiplier() {
    // Valid: depth multiplier 1 adds no further constraints
    let mut graph = Graph::new();
    let op = create_op_with_quant_tensors(
        &mut graph,
        OpKind::DepthwiseConv2DBias,
        &[1, 1, 1, 1],
        &[1, 1, 1, 2],
    );
    add_weights(&mut graph, op, &[1, 1, 1, 1]);
    set_stride(&mut graph, op, 1, 1);
    graph.op_mut(op).attrs.set(Attr::DepthMultiplier, AttrValue::Int(1));
    assert!(support().is_operator_supported(&graph, op));

    // Invalid: depth multiplier does not equal the OFM channel count
    let op = create_op_with_quant_tensors(
        &mut graph,
        OpKind::DepthwiseConv2DBias,
        &[1, 1, 1, 1],
        &[1, 1, 1, 1],
    );
    add_weights(&mut graph, op, &[1, 1, 1, 1]);
    set_stride(&mut graph, op, 1, 1);
    graph.op_mut(op).attrs.set(Attr::DepthMultiplier, AttrValue::Int(2));
    assert!(!support().is_operator_supported(&graph, op));

    // Valid: depth multiplier equals the OFM channel count
    let op = create_op_with_quant_tensors(
        &mut graph,
        OpKind::DepthwiseConv2DBias,
        &[1, 1, 1, 1],
        &[1, 1, 1, 2],
    );
    add_weights(&mut graph, op, &[1, 1, 1, 1]);
    set_stride(&mut graph, op, 1, 1);
    graph.op_mut(op).attrs.set(Attr::DepthMultiplier, AttrValue::Int(2));
    assert!(support().is_operator_supported(&graph, op));
}

fn create_tconv_op(
    graph: &mut Graph,
    ofm_shape: &[u32],
    weights_shape: &[u32],
    stride: i64,
    padding: Padding,
) -> OpId {
    let op = create_op_with_quant_tensors(graph, OpKind::Conv2DBackpropInput, &[0], ofm_shape);
    add_weights(graph, op, weights_shape);
    let ifm = feature_tensor(graph, &[1, 1, 1, 1], DataType::UInt8, "ifm");
    graph.add_op_input(op, ifm);
    set_stride(graph, op, stride, stride);
    set_padding(graph, op, padding);
    op
}

#[test]
fn constraint_tconv_stride() {
    // Strides must be 2
    let mut graph = Graph::new();
    let op = create_tconv_op(&mut graph, &[1, 2, 2, 1], &[1, 1, 1, 1], 1, Padding::Same);
    assert!(!support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_tconv_same() {
    let mut graph = Graph::new();
    let op = create_tconv_op(&mut graph, &[1, 2, 2, 1], &[1, 1, 1, 1], 2, Padding::Same);
    assert!(support().is_operator_supported(&graph, op));
    let op = create_tconv_op(&mut graph, &[1, 4, 4, 1], &[1, 1, 1, 1], 2, Padding::Same);
    assert!(!support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_tconv_valid() {
    let mut graph = Graph::new();
    let op = create_tconv_op(&mut graph, &[1, 4, 4, 1], &[4, 4, 1, 1], 2, Padding::Valid);
    assert!(support().is_operator_supported(&graph, op));
    let op = create_tconv_op(&mut graph, &[1, 4, 4, 1], &[2, 2, 1, 1], 2, Padding::Valid);
    assert!(!support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_matching_in_out_types() {
    let mut graph = Graph::new();
    let op = create_op_with_quant_tensors(&mut graph, OpKind::AvgPool, &[1, 8, 8, 8], &[1, 8, 8, 8]);
    set_stride(&mut graph, op, 2, 2);
    set_filter(&mut graph, op, 2, 2);
    set_padding(&mut graph, op, Padding::Same);
    assert!(support().is_operator_supported(&graph, op));
    // IFM and OFM datatypes must match
    let ifm = graph.op(op).ifm().unwrap();
    graph.tensor_mut(ifm).dtype = DataType::Int8;
    assert!(!support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_filter_range() {
    // SAME padding restricts the filter to 8x8
    let mut graph = Graph::new();
    let op = create_op_with_quant_tensors(&mut graph, OpKind::AvgPool, &[1, 8, 8, 8], &[1, 8, 8, 8]);
    set_stride(&mut graph, op, 2, 2);
    set_filter(&mut graph, op, 20, 20);
    set_padding(&mut graph, op, Padding::Same);
    assert!(!support().is_operator_supported(&graph, op));
    // VALID padding limits are much larger
    set_padding(&mut graph, op, Padding::Valid);
    assert!(support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_filter_height_range_valid_pad() {
    let mut graph = Graph::new();
    let op = create_op_with_quant_tensors(&mut graph, OpKind::AvgPool, &[1, 8, 8, 8], &[1, 8, 8, 8]);
    set_stride(&mut graph, op, 2, 2);
    set_filter(&mut graph, op, 2, 256);
    set_padding(&mut graph, op, Padding::Valid);
    assert!(support().is_operator_supported(&graph, op));
    // VALID padding restricts the filter height to 256
    set_filter(&mut graph, op, 2, 257);
    assert!(!support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_filter_product_range_valid_pad() {
    let mut graph = Graph::new();
    let op = create_op_with_quant_tensors(&mut graph, OpKind::AvgPool, &[1, 8, 8, 8], &[1, 8, 8, 8]);
    set_stride(&mut graph, op, 2, 2);
    set_filter(&mut graph, op, 256, 256);
    set_padding(&mut graph, op, Padding::Valid);
    assert!(support().is_operator_supported(&graph, op));
    // VALID padding restricts the filter to 256x256
    set_filter(&mut graph, op, 257, 256);
    assert!(!support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_filter_height_range() {
    // Max pool restrictions do not depend on padding
    let mut graph = Graph::new();
    let op = create_op_with_quant_tensors(&mut graph, OpKind::MaxPool, &[1, 8, 8, 8], &[1, 8, 8, 8]);
    set_stride(&mut graph, op, 2, 2);
    set_filter(&mut graph, op, 2, 256);
    set_padding(&mut graph, op, Padding::Same);
    assert!(support().is_operator_supported(&graph, op));
    set_filter(&mut graph, op, 2, 257);
    assert!(!support().is_operator_supported(&graph, op));
    set_padding(&mut graph, op, Padding::Valid);
    assert!(!support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_filter_product_range() {
    let mut graph = Graph::new();
    let op = create_op_with_quant_tensors(&mut graph, OpKind::MaxPool, &[1, 8, 8, 8], &[1, 8, 8, 8]);
    set_stride(&mut graph, op, 2, 2);
    set_filter(&mut graph, op, 256, 256);
    set_padding(&mut graph, op, Padding::Same);
    assert!(support().is_operator_supported(&graph, op));
    set_filter(&mut graph, op, 257, 256);
    assert!(!support().is_operator_supported(&graph, op));
    set_padding(&mut graph, op, Padding::Valid);
    assert!(!support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_resize() {
    let mut graph = Graph::new();
    // IFM W and H are both 1
    let op = create_op_with_quant_tensors(&mut graph, OpKind::ResizeBilinear, &[1, 1, 1, 8], &[1, 8, 8, 8]);
    assert!(support().is_operator_supported(&graph, op));
    // IFM matches OFM
    let op = create_op_with_quant_tensors(&mut graph, OpKind::ResizeBilinear, &[1, 8, 8, 8], &[1, 8, 8, 8]);
    assert!(support().is_operator_supported(&graph, op));
    // OFM is 2x IFM, without corner alignment
    let op = create_op_with_quant_tensors(&mut graph, OpKind::ResizeBilinear, &[1, 4, 4, 8], &[1, 8, 8, 8]);
    assert!(support().is_operator_supported(&graph, op));
    // OFM is 2x IFM - 1, with corner alignment
    let op = create_op_with_quant_tensors(&mut graph, OpKind::ResizeBilinear, &[1, 4, 4, 8], &[1, 7, 7, 8]);
    graph.op_mut(op).attrs.set(Attr::AlignCorners, AttrValue::Bool(true));
    assert!(support().is_operator_supported(&graph, op));
    // Invalid cases
    let op = create_op_with_quant_tensors(&mut graph, OpKind::ResizeBilinear, &[1, 4, 4, 8], &[1, 20, 20, 8]);
    assert!(!support().is_operator_supported(&graph, op));
    graph.op_mut(op).attrs.set(Attr::AlignCorners, AttrValue::Bool(true));
    assert!(!support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_matching_shapes() {
    // Softmax requires the ifm and ofm shapes to match
    let mut graph = Graph::new();
    let op = create_op_with_quant_tensors(&mut graph, OpKind::Softmax, &[1, 1, 1, 8], &[1, 2, 2, 4]);
    assert!(!support().is_operator_supported(&graph, op));
    let op = create_op_with_quant_tensors(&mut graph, OpKind::Softmax, &[1, 1, 1, 8], &[1, 1, 1, 8]);
    assert!(support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_beta_value_range() {
    // Beta must not be negative
    let mut graph = Graph::new();
    let op = create_op_with_quant_tensors(&mut graph, OpKind::Softmax, &[1, 1, 1, 8], &[1, 1, 1, 8]);
    graph.op_mut(op).attrs.set(Attr::Beta, AttrValue::Float(-1.0));
    assert!(!support().is_operator_supported(&graph, op));
    graph.op_mut(op).attrs.set(Attr::Beta, AttrValue::Float(0.0));
    assert!(support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_splitv_inferred() {
    // SplitV allows at most one inferred size (-1)
    let mut graph = Graph::new();
    let op = create_op_with_quant_tensors(&mut graph, OpKind::SplitV, &[1, 1, 1, 8], &[1, 1, 1, 8]);
    let sizes = const_tensor(&mut graph, "sizes", &[1, 1, 1, 4], DataType::Int16, vec![0, -1, 2, -1]);
    graph.add_op_input(op, sizes);
    assert!(!support().is_operator_supported(&graph, op));

    let op = create_op_with_quant_tensors(&mut graph, OpKind::SplitV, &[1, 1, 1, 8], &[1, 1, 1, 8]);
    let sizes = const_tensor(&mut graph, "sizes", &[1, 1, 1, 4], DataType::Int16, vec![0, 1, 2, -1]);
    graph.add_op_input(op, sizes);
    assert!(support().is_operator_supported(&graph, op));
}

fn create_concat_op(graph: &mut Graph, ifm2_shape: &[u32]) -> OpId {
    let op = create_op_with_quant_tensors(graph, OpKind::Concat, &[1, 1, 1, 4], &[1, 1, 1, 8]);
    let ifm2 = feature_tensor(graph, ifm2_shape, DataType::UInt8, "in2");
    graph.add_op_input(op, ifm2);
    op
}

#[test]
fn constraint_concat_pass() {
    // A working concat
    let mut graph = Graph::new();
    let op = create_concat_op(&mut graph, &[1, 1, 1, 4]);
    graph.op_mut(op).attrs.set(Attr::Axis, AttrValue::Int(3));
    assert!(support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_axis_exists() {
    // Missing axis attribute
    let mut graph = Graph::new();
    let op = create_concat_op(&mut graph, &[1, 1, 1, 4]);
    assert!(!support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_axis_valid() {
    // Invalid axis attribute
    let mut graph = Graph::new();
    let op = create_concat_op(&mut graph, &[1, 1, 1, 4]);
    graph.op_mut(op).attrs.set(Attr::Axis, AttrValue::Int(7));
    assert!(!support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_matching_dimensionality() {
    // Mismatching dimensionality: 4D + 2D = 4D
    let mut graph = Graph::new();
    let op = create_concat_op(&mut graph, &[1, 4]);
    graph.op_mut(op).attrs.set(Attr::Axis, AttrValue::Int(3));
    assert!(!support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_valid_dimensions() {
    // ifm2 has w and h as 2, which is not the concat axis and matches
    // neither ifm1 nor ofm
    let mut graph = Graph::new();
    let op = create_concat_op(&mut graph, &[1, 2, 2, 4]);
    graph.op_mut(op).attrs.set(Attr::Axis, AttrValue::Int(3));
    assert!(!support().is_operator_supported(&graph, op));
}

fn create_strided_slice_op(
    graph: &mut Graph,
    in_shape: &[u32],
    out_shape: &[u32],
    begin: &[i64],
    end: &[i64],
) -> OpId {
    let ifm = feature_tensor(graph, in_shape, DataType::UInt8, "in");
    let count = begin.len() as u32;
    let begin_tens = const_tensor(graph, "begin", &[count], DataType::UInt8, begin.to_vec());
    let end_tens = const_tensor(graph, "end", &[count], DataType::UInt8, end.to_vec());
    let strides = const_tensor(graph, "strides", &[count], DataType::UInt8, vec![1; begin.len()]);
    let ofm = feature_tensor(graph, out_shape, DataType::UInt8, "out");
    let mut op = Operation::new(OpKind::StridedSlice, "strided_slice");
    op.inputs = vec![ifm, begin_tens, end_tens, strides];
    op.outputs = vec![ofm];
    for key in [
        Attr::EllipsisMask,
        Attr::NewAxisMask,
        Attr::ShrinkAxisMask,
        Attr::BeginMask,
        Attr::EndMask,
    ] {
        op.attrs.set(key, AttrValue::Int(0));
    }
    graph.add_op(op)
}

fn create_strided_slice(graph: &mut Graph) -> OpId {
    let op = create_strided_slice_op(
        graph,
        &[1, 10, 10, 10],
        &[1, 5, 5, 10],
        &[127, 2, 2, 0],
        &[0, 7, -3, 0],
    );
    graph.op_mut(op).attrs.set(Attr::BeginMask, AttrValue::Int(1));
    graph.op_mut(op).attrs.set(Attr::EndMask, AttrValue::Int(9));
    assert!(support().is_operator_supported(graph, op));
    op
}

#[test]
fn constraint_stridedslice_input_count() {
    // Wrong number of input tensors
    let mut graph = Graph::new();
    let op = create_strided_slice(&mut graph);
    let extra = feature_tensor(&mut graph, &[1, 10, 10, 10], DataType::UInt8, "extra");
    graph.add_op_input(op, extra);
    assert!(!support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_stridedslice_inputs_const() {
    // Begin, end and stride values must not be None
    let mut graph = Graph::new();
    for index in [1, 2, 3] {
        let op = create_strided_slice(&mut graph);
        let tens = graph.op(op).inputs[index];
        graph.tensor_mut(tens).values = None;
        assert!(!support().is_operator_supported(&graph, op));
    }
}

#[test]
fn constraint_stridedslice_stride_values() {
    // Unsupported strides
    let mut graph = Graph::new();
    let op = create_strided_slice(&mut graph);
    let strides = graph.op(op).inputs[3];
    graph.tensor_mut(strides).values = Some(vec![1, 1, 2, 1]);
    assert!(!support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_ellipsis_mask() {
    let mut graph = Graph::new();
    let op = create_strided_slice(&mut graph);
    graph.op_mut(op).attrs.set(Attr::EllipsisMask, AttrValue::Int(1));
    assert!(!support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_axis_masks() {
    // Setting one of new_axis_mask/shrink_axis_mask is fine
    let mut graph = Graph::new();
    let op = create_strided_slice(&mut graph);
    graph.op_mut(op).attrs.set(Attr::NewAxisMask, AttrValue::Int(2));
    assert!(support().is_operator_supported(&graph, op));

    let op = create_strided_slice(&mut graph);
    graph.op_mut(op).attrs.set(Attr::ShrinkAxisMask, AttrValue::Int(3));
    assert!(support().is_operator_supported(&graph, op));
    // But not both
    graph.op_mut(op).attrs.set(Attr::NewAxisMask, AttrValue::Int(2));
    assert!(!support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_slice_ranges() {
    // Examples where end offset <= begin offset
    let mut graph = Graph::new();
    let op = create_strided_slice(&mut graph);
    let begin = graph.op(op).inputs[1];
    graph.tensor_mut(begin).values = Some(vec![0, 7, 2, 0]);
    assert!(!support().is_operator_supported(&graph, op));

    let op = create_strided_slice(&mut graph);
    let end = graph.op(op).inputs[2];
    graph.tensor_mut(end).values = Some(vec![0, 7, 2, 0]);
    assert!(!support().is_operator_supported(&graph, op));

    let op = create_strided_slice(&mut graph);
    graph.op_mut(op).attrs.set(Attr::BeginMask, AttrValue::Int(0));
    assert!(!support().is_operator_supported(&graph, op));

    let op = create_strided_slice(&mut graph);
    graph.op_mut(op).attrs.set(Attr::EndMask, AttrValue::Int(0));
    assert!(!support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_matching_inputs_types() {
    // Input datatypes must match
    let mut graph = Graph::new();
    let op = create_elemwise_op(&mut graph, OpKind::Mul, "op", &[1, 8, 8, 8], Some(&[1, 8, 8, 8]), &[1, 8, 8, 8]);
    let ifm2 = graph.op(op).ifm2().unwrap();
    graph.tensor_mut(ifm2).dtype = DataType::Int8;
    assert!(!support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_matching_signed() {
    // Signed inputs require the output to also be signed
    let mut graph = Graph::new();
    let op = create_elemwise_op_dtype(
        &mut graph,
        OpKind::Mul,
        "op",
        &[1, 8, 8, 8],
        Some(&[1, 8, 8, 8]),
        &[1, 8, 8, 8],
        DataType::Int8,
    );
    let ofm = graph.op(op).ofm().unwrap();
    graph.tensor_mut(ofm).dtype = DataType::UInt8;
    assert!(!support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_unsigned_valid() {
    // Unsigned inputs require the output to be the same type...
    let mut graph = Graph::new();
    let op = create_elemwise_op(&mut graph, OpKind::Mul, "op", &[1, 8, 8, 8], Some(&[1, 8, 8, 8]), &[1, 8, 8, 8]);
    assert!(support().is_operator_supported(&graph, op));
    let ofm = graph.op(op).ofm().unwrap();
    graph.tensor_mut(ofm).dtype = DataType::Int8;
    assert!(!support().is_operator_supported(&graph, op));
    graph.tensor_mut(ofm).dtype = DataType::Int16;
    assert!(!support().is_operator_supported(&graph, op));
    // ...or int32
    graph.tensor_mut(ofm).dtype = DataType::Int32;
    assert!(support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_inputs_int32() {
    // Both inputs must be int32
    let mut graph = Graph::new();
    let op = create_elemwise_op(&mut graph, OpKind::Shl, "op", &[1, 8, 8, 8], Some(&[1, 8, 8, 8]), &[1, 8, 8, 8]);
    assert!(!support().is_operator_supported(&graph, op));
    let op = create_elemwise_op_dtype(
        &mut graph,
        OpKind::Shl,
        "op",
        &[1, 8, 8, 8],
        Some(&[1, 8, 8, 8]),
        &[1, 8, 8, 8],
        DataType::Int32,
    );
    assert!(support().is_operator_supported(&graph, op));
    let ifm2 = graph.op(op).ifm2().unwrap();
    graph.tensor_mut(ifm2).dtype = DataType::Int16;
    assert!(!support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_output_int32() {
    // Output must be int32
    let mut graph = Graph::new();
    let op = create_elemwise_op_dtype(
        &mut graph,
        OpKind::Shl,
        "op",
        &[1, 8, 8, 8],
        Some(&[1, 8, 8, 8]),
        &[1, 8, 8, 8],
        DataType::Int32,
    );
    assert!(support().is_operator_supported(&graph, op));
    let ofm = graph.op(op).ofm().unwrap();
    graph.tensor_mut(ofm).dtype = DataType::Int16;
    assert!(!support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_matching_quantization_parameters() {
    let qp = QuantizationParameters {
        scale_f32: Some(1.5),
        zero_point: ZeroPoint::Scalar(128),
        ..Default::default()
    };
    // Valid: everything matches the defaults
    let mut graph = Graph::new();
    let op = create_elemwise_op(&mut graph, OpKind::Minimum, "op", &[1, 8, 8, 8], Some(&[1, 8, 8, 8]), &[1, 8, 8, 8]);
    assert!(support().is_operator_supported(&graph, op));
    // Invalid: ifm mismatches ofm
    let ifm = graph.op(op).ifm().unwrap();
    graph.tensor_mut(ifm).quantization = Some(qp.clone());
    assert!(!support().is_operator_supported(&graph, op));
    // Invalid: ifm2 mismatches ofm
    let op = create_elemwise_op(&mut graph, OpKind::Minimum, "op", &[1, 8, 8, 8], Some(&[1, 8, 8, 8]), &[1, 8, 8, 8]);
    let ifm2 = graph.op(op).ifm2().unwrap();
    graph.tensor_mut(ifm2).quantization = Some(qp.clone());
    assert!(!support().is_operator_supported(&graph, op));
    // Invalid: both mismatch ofm; valid again once ofm matches too
    let op = create_elemwise_op(&mut graph, OpKind::Minimum, "op", &[1, 8, 8, 8], Some(&[1, 8, 8, 8]), &[1, 8, 8, 8]);
    let ifm = graph.op(op).ifm().unwrap();
    let ifm2 = graph.op(op).ifm2().unwrap();
    let ofm = graph.op(op).ofm().unwrap();
    graph.tensor_mut(ifm).quantization = Some(qp.clone());
    graph.tensor_mut(ifm2).quantization = Some(qp.clone());
    assert!(!support().is_operator_supported(&graph, op));
    graph.tensor_mut(ofm).quantization = Some(qp);
    assert!(support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_elemwise_batch_size() {
    // Binary case: batch can be > 1 if dims <= 2D
    let mut graph = Graph::new();
    let op = create_elemwise_op(&mut graph, OpKind::Add, "op", &[2, 2], Some(&[2, 2]), &[2, 2]);
    assert!(support().is_operator_supported(&graph, op));
    let op = create_elemwise_op(&mut graph, OpKind::Add, "op", &[1, 2, 2], Some(&[1, 2, 2]), &[1, 2, 2]);
    assert!(support().is_operator_supported(&graph, op));
    let op = create_elemwise_op(&mut graph, OpKind::Add, "op", &[2, 2, 2], Some(&[2, 2, 2]), &[2, 2, 2]);
    assert!(!support().is_operator_supported(&graph, op));

    // Unary case
    let op = create_elemwise_op_dtype(&mut graph, OpKind::Clz, "op", &[2, 2], None, &[2, 2], DataType::Int32);
    assert!(support().is_operator_supported(&graph, op));
    let op = create_elemwise_op_dtype(&mut graph, OpKind::Clz, "op", &[1, 2, 2], None, &[1, 2, 2], DataType::Int32);
    assert!(support().is_operator_supported(&graph, op));
    let op = create_elemwise_op_dtype(&mut graph, OpKind::Clz, "op", &[2, 2, 2], None, &[2, 2, 2], DataType::Int32);
    assert!(!support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_matching_either_shapes() {
    // Binary case: at least one input shape must match the output's
    let mut graph = Graph::new();
    let op = create_elemwise_op(&mut graph, OpKind::Add, "op", &[1, 4], Some(&[4, 4]), &[4, 4]);
    assert!(support().is_operator_supported(&graph, op));
    let op = create_elemwise_op(&mut graph, OpKind::Add, "op", &[4, 4], Some(&[1, 4]), &[4, 4]);
    assert!(support().is_operator_supported(&graph, op));
    let op = create_elemwise_op(&mut graph, OpKind::Add, "op", &[4, 4], Some(&[4, 4]), &[2, 2]);
    assert!(!support().is_operator_supported(&graph, op));
    let op = create_elemwise_op(&mut graph, OpKind::Add, "op", &[1, 4, 1, 16], Some(&[1, 1, 4, 1]), &[1, 4, 4, 16]);
    assert!(!support().is_operator_supported(&graph, op));
    let op = create_elemwise_op(&mut graph, OpKind::Add, "op", &[1, 1, 4, 1], Some(&[1, 4, 1, 16]), &[1, 4, 4, 16]);
    assert!(!support().is_operator_supported(&graph, op));

    // Unary case: the input shape must match the output shape
    let op = create_elemwise_op_dtype(&mut graph, OpKind::Clz, "op", &[2, 2], None, &[2, 2], DataType::Int32);
    assert!(support().is_operator_supported(&graph, op));
    let op = create_elemwise_op_dtype(&mut graph, OpKind::Clz, "op", &[4, 4], None, &[2, 2], DataType::Int32);
    assert!(!support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_broadcast_shapes() {
    // Broadcasting is allowed along rank indices of dimension 1
    let mut graph = Graph::new();
    let op = create_elemwise_op(&mut graph, OpKind::Add, "op", &[1, 1, 4], Some(&[1, 2, 4]), &[1, 2, 4]);
    assert!(support().is_operator_supported(&graph, op));
    let op = create_elemwise_op(&mut graph, OpKind::Add, "op", &[1, 2, 4], Some(&[1, 1, 4]), &[1, 2, 4]);
    assert!(support().is_operator_supported(&graph, op));
    let op = create_elemwise_op(&mut graph, OpKind::Add, "op", &[1, 1, 1, 1], Some(&[1, 4, 8, 16]), &[1, 4, 8, 16]);
    assert!(support().is_operator_supported(&graph, op));
    let op = create_elemwise_op(&mut graph, OpKind::Add, "op", &[1, 4, 8, 16], Some(&[1, 1, 1, 1]), &[1, 4, 8, 16]);
    assert!(support().is_operator_supported(&graph, op));
    // A broadcast dimension that is not 1
    let op = create_elemwise_op(&mut graph, OpKind::Add, "op", &[1, 2, 4], Some(&[1, 4, 4]), &[1, 4, 4]);
    assert!(!support().is_operator_supported(&graph, op));
    let op = create_elemwise_op(&mut graph, OpKind::Add, "op", &[1, 4, 4], Some(&[1, 2, 4]), &[1, 4, 4]);
    assert!(!support().is_operator_supported(&graph, op));
    // The OFM dimension must take the largest input dimension
    let op = create_elemwise_op(&mut graph, OpKind::Add, "op", &[1, 4], Some(&[4, 4]), &[1, 4]);
    assert!(!support().is_operator_supported(&graph, op));
    let op = create_elemwise_op(&mut graph, OpKind::Add, "op", &[1, 4, 1, 16], Some(&[1, 1, 4, 1]), &[1, 4, 1, 16]);
    assert!(!support().is_operator_supported(&graph, op));
    let op = create_elemwise_op(&mut graph, OpKind::Add, "op", &[1, 1, 4, 1], Some(&[1, 4, 1, 16]), &[1, 4, 1, 16]);
    assert!(!support().is_operator_supported(&graph, op));
}

#[test]
fn constraint_alpha_valid() {
    // Alpha cannot be negative
    let mut graph = Graph::new();
    let op = create_elemwise_op(&mut graph, OpKind::LeakyRelu, "op", &[2, 2], None, &[2, 2]);
    graph.op_mut(op).attrs.set(Attr::Alpha, AttrValue::Float(0.0));
    assert!(support().is_operator_supported(&graph, op));
    graph.op_mut(op).attrs.set(Attr::Alpha, AttrValue::Float(-1.0));
    assert!(!support().is_operator_supported(&graph, op));
}

#[test]
fn unsupported_kind_is_cpu_only() {
    let mut graph = Graph::new();
    let op = create_op_with_quant_tensors(&mut graph, OpKind::Pad, &[1, 8, 8, 8], &[1, 10, 10, 8]);
    assert!(!support().is_operator_supported(&graph, op));
}
