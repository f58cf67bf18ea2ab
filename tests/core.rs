mod common;

use accel_nn::Error;
use accel_nn::approx::{all_close, approx_eq};
use accel_nn::nn::layers::{Activation, Layer, LayerSpec, OutputSpec};
use accel_nn::nn::network::Network;
use accel_nn::nn::optim::{Optimizer, OptimizerState, Regularization};
use accel_nn::nn::tensors::{DeviceTensor, Shape, Storage};
use accel_nn::training::Sample;

fn all_optimizers() -> [Optimizer; 5] {
    [
        Optimizer::Sgd { learning_rate: 0.1 },
        Optimizer::Momentum {
            learning_rate: 0.1,
            momentum: 0.9,
        },
        Optimizer::AdaGrad {
            learning_rate: 0.1,
            epsilon: 1e-8,
        },
        Optimizer::RmsProp {
            learning_rate: 0.1,
            decay: 0.9,
            epsilon: 1e-8,
        },
        Optimizer::AdaDelta {
            decay: 0.95,
            epsilon: 1e-6,
        },
    ]
}

fn dense_2x2() -> LayerSpec {
    // rows: [w00, w01, b0], [w10, w11, b1]
    LayerSpec::Dense {
        inputs: 2,
        outputs: 2,
        weights: Some(vec![1.0, 2.0, 0.5, -1.0, 0.0, 1.0]),
    }
}

#[test]
fn test_network_rejects_mismatched_layers() {
    let layers = [LayerSpec::dense(3, 4), LayerSpec::dense(5, 2)];
    let err = Network::validate(&layers, &common::linear_output(2)).unwrap_err();
    assert!(matches!(
        err,
        Error::LayerChain { index: 0, kind: "dense", output, input }
            if output == Shape::vector(4) && input == Shape::vector(5)
    ));

    let layers = [LayerSpec::dense(3, 4)];
    let err = Network::validate(&layers, &common::linear_output(2)).unwrap_err();
    assert!(matches!(err, Error::LayerChain { index: 0, kind: "output", .. }));

    let layers = [
        LayerSpec::convolution(Shape::new(6, 6, 1), 2, 3, 3),
        LayerSpec::Pooling {
            input: Shape::new(4, 4, 2),
            output: Shape::new(2, 2, 2),
        },
        LayerSpec::Reshape {
            input: Shape::new(2, 2, 2),
            output: Shape::vector(8),
        },
        LayerSpec::dense(8, 3),
    ];
    assert!(Network::validate(&layers, &OutputSpec::Softmax { shape: Shape::vector(3) }).is_ok());
}

#[test]
fn test_network_construction_fails_before_allocating() {
    let Some(ctx) = common::fresh_gpu() else { return };

    let err = Network::new(
        &ctx,
        vec![LayerSpec::dense(2, 3), LayerSpec::dense(2, 1)],
        common::linear_output(1),
    )
    .unwrap_err();
    assert!(matches!(err, Error::LayerChain { index: 0, .. }));
    assert_eq!(ctx.cached_kernels(), 0);
    assert_eq!(ctx.compiled_modules(), 0);

    // a valid chain on the same context does compile
    Network::new(&ctx, vec![LayerSpec::dense(2, 1)], common::linear_output(1)).unwrap();
    assert!(ctx.cached_kernels() > 0);
}

#[test]
fn test_dense_forward() {
    let Some(ctx) = common::gpu() else { return };

    let mut network = Network::new(&ctx, vec![dense_2x2()], common::linear_output(2)).unwrap();
    assert_eq!(network.input_shape(), Shape::vector(2));
    assert_eq!(network.output_shape(), Shape::vector(2));

    let out = network.feed_forward(&[3.0, 4.0]).unwrap();
    assert!(approx_eq(&out[..], &[11.5, -2.0]));

    assert!(matches!(network.feed_forward(&[1.0]), Err(Error::ValueCount { .. })));
}

#[test]
fn test_dense_layers_of_different_widths_share_a_context() {
    let Some(ctx) = common::fresh_gpu() else { return };

    let mut narrow = Network::new(
        &ctx,
        vec![LayerSpec::Dense {
            inputs: 2,
            outputs: 1,
            weights: Some(vec![1.0, 2.0, 0.5]),
        }],
        common::linear_output(1),
    )
    .unwrap();
    assert!(approx_eq(&narrow.feed_forward(&[3.0, 4.0]).unwrap()[..], &[11.5]));
    let narrow_modules = ctx.compiled_modules();

    let mut wide = Network::new(&ctx, vec![dense_2x2()], common::linear_output(2)).unwrap();
    assert!(approx_eq(&wide.feed_forward(&[3.0, 4.0]).unwrap()[..], &[11.5, -2.0]));
    assert!(ctx.compiled_modules() > narrow_modules);

    let mut wider = Network::new(
        &ctx,
        vec![LayerSpec::Dense {
            inputs: 3,
            outputs: 4,
            weights: Some(vec![1.0; 16]),
        }],
        common::linear_output(4),
    )
    .unwrap();
    assert!(approx_eq(&wider.feed_forward(&[1.0, 2.0, 3.0]).unwrap()[..], &[7.0; 4]));

    // the narrow network still runs with its own group size
    assert!(approx_eq(&narrow.feed_forward(&[3.0, 4.0]).unwrap()[..], &[11.5]));
}

#[test]
fn test_dense_backward_accumulates() {
    let Some(ctx) = common::gpu() else { return };

    let mut network = Network::new(
        &ctx,
        vec![LayerSpec::Dense {
            inputs: 2,
            outputs: 1,
            weights: Some(vec![0.5, -1.0, 0.25]),
        }],
        common::linear_output(1),
    )
    .unwrap();

    // actual = 1 - 3 + 0.25 = -1.75, gradient at output = -2.75
    let sample = Sample::new(vec![2.0, 3.0], vec![1.0]);
    let loss = network.train_one_sample(&sample).unwrap();
    assert!(approx_eq(&loss, &(0.5 * 2.75 * 2.75)));

    let gradient = network.parameters()[0].gradient.download().unwrap();
    assert!(approx_eq(&gradient[..], &[-5.5, -8.25, -2.75]));

    // a second sample adds to the gradient instead of replacing it
    network.train_one_sample(&sample).unwrap();
    let gradient = network.parameters()[0].gradient.download().unwrap();
    assert!(approx_eq(&gradient[..], &[-11.0, -16.5, -5.5]));

    // weights are untouched until an optimizer runs
    let weights = network.parameters()[0].weights.download().unwrap();
    assert_eq!(weights, vec![0.5, -1.0, 0.25]);
}

#[test]
fn test_pooling_forward_and_backward() {
    let Some(ctx) = common::gpu() else { return };

    let spec = LayerSpec::Pooling {
        input: Shape::new(4, 4, 1),
        output: Shape::new(2, 2, 1),
    };
    let mut layer = Layer::build(&ctx, &spec, true).unwrap();
    let input = DeviceTensor::from_values(
        &ctx,
        Shape::new(4, 4, 1),
        &[
            1.0, 2.0, 5.0, 6.0, //
            3.0, 4.0, 7.0, 8.0, //
            9.0, 10.0, 13.0, 14.0, //
            11.0, 12.0, 15.0, 16.0,
        ],
        Storage::Private,
        "pool input",
    )
    .unwrap();
    let next_gradient = common::tensor(&ctx, Shape::new(2, 2, 1), &[1.0; 4]);

    let mut stream = ctx.command_stream("pooling");
    let output = layer.forward(&mut stream, &input).unwrap();
    let input_gradient = layer.backward(&mut stream, &next_gradient, &input).unwrap();
    stream.commit_and_wait().unwrap();

    assert_eq!(output.download().unwrap(), vec![4.0, 8.0, 12.0, 16.0]);
    assert_eq!(
        input_gradient.download().unwrap(),
        vec![
            0.0, 0.0, 0.0, 0.0, //
            0.0, 1.0, 0.0, 1.0, //
            0.0, 0.0, 0.0, 0.0, //
            0.0, 1.0, 0.0, 1.0,
        ]
    );
    assert!(layer.parameters().is_empty());
}

#[test]
fn test_convolution_forward_and_backward() {
    let Some(ctx) = common::gpu() else { return };

    let spec = LayerSpec::Convolution {
        input: Shape::new(3, 3, 1),
        kernels: 1,
        kernel_width: 2,
        kernel_height: 2,
        stride: (1, 1),
        inset: (0, 0),
        weights: Some(vec![1.0, 0.0, 0.0, 1.0]),
        bias: Some(vec![0.5]),
    };
    let mut layer = Layer::build(&ctx, &spec, true).unwrap();
    assert_eq!(layer.output_shape(), Shape::new(2, 2, 1));

    let values: Vec<f32> = (1..=9).map(|v| v as f32).collect();
    let input = common::tensor(&ctx, Shape::new(3, 3, 1), &values);
    let next_gradient = common::tensor(&ctx, Shape::new(2, 2, 1), &[1.0; 4]);

    let mut stream = ctx.command_stream("convolution");
    let output = layer.forward(&mut stream, &input).unwrap();
    let input_gradient = layer.backward(&mut stream, &next_gradient, &input).unwrap();
    stream.commit_and_wait().unwrap();

    assert!(approx_eq(&output.download().unwrap()[..], &[6.5, 8.5, 12.5, 14.5]));
    assert!(approx_eq(
        &input_gradient.download().unwrap()[..],
        &[1.0, 1.0, 0.0, 1.0, 2.0, 1.0, 0.0, 1.0, 1.0]
    ));

    let parameters = layer.parameters();
    assert_eq!(parameters.len(), 2);
    assert!(approx_eq(&parameters[0].gradient.download().unwrap()[..], &[12.0, 16.0, 24.0, 28.0]));
    assert!(approx_eq(&parameters[1].gradient.download().unwrap()[..], &[4.0]));
}

#[test]
fn test_convolution_negative_inset_pads_with_zeros() {
    let Some(ctx) = common::gpu() else { return };

    let spec = LayerSpec::Convolution {
        input: Shape::new(2, 2, 1),
        kernels: 1,
        kernel_width: 3,
        kernel_height: 3,
        stride: (1, 1),
        inset: (-1, -1),
        weights: Some(vec![1.0; 9]),
        bias: Some(vec![0.0]),
    };
    let mut network = Network::new(&ctx, vec![spec], OutputSpec::Activation {
        shape: Shape::new(2, 2, 1),
        activation: Activation::Linear,
    })
    .unwrap();
    let out = network.feed_forward(&[1.0, 2.0, 3.0, 4.0]).unwrap();
    assert!(approx_eq(&out[..], &[10.0, 10.0, 10.0, 10.0]));
}

#[test]
fn test_strided_convolution_with_depth() {
    let Some(ctx) = common::gpu() else { return };

    // two input slices, two kernels of 1x1 over both slices, stride 2
    let spec = LayerSpec::Convolution {
        input: Shape::new(4, 2, 2),
        kernels: 2,
        kernel_width: 1,
        kernel_height: 1,
        stride: (2, 2),
        inset: (0, 0),
        // kernel 0: slice weights (1, 0); kernel 1: (1, 1)
        weights: Some(vec![1.0, 0.0, 1.0, 1.0]),
        bias: Some(vec![0.0, 0.0]),
    };
    let mut network = Network::new(&ctx, vec![spec], OutputSpec::Activation {
        shape: Shape::new(2, 1, 2),
        activation: Activation::Linear,
    })
    .unwrap();

    let input: Vec<f32> = (0..16).map(|v| v as f32).collect();
    let out = network.feed_forward(&input).unwrap();
    // samples x = 0, 2 of row 0: kernel 0 reads slice 0 only, kernel 1 sums both slices
    assert!(approx_eq(&out[..], &[0.0, 2.0, 8.0, 12.0]));
}

#[test]
fn test_activation_layers() {
    let Some(ctx) = common::gpu() else { return };

    let shape = Shape::vector(3);
    let input = common::tensor(&ctx, shape, &[-1.0, 0.0, 2.0]);
    let ones = DeviceTensor::from_values(&ctx, shape, &[1.0; 3], Storage::Private, "ones").unwrap();

    for activation in [Activation::Sigmoid, Activation::Tanh, Activation::Relu] {
        let mut layer =
            Layer::build(&ctx, &LayerSpec::Activation { shape, activation }, true).unwrap();
        let mut stream = ctx.command_stream("activation");
        let output = layer.forward(&mut stream, &input).unwrap();
        let gradient = layer.backward(&mut stream, &ones, &input).unwrap();
        stream.commit_and_wait().unwrap();

        let expected: Vec<f32> = [-1.0f32, 0.0, 2.0].iter().map(|&x| activation.apply(x)).collect();
        let output = output.download().unwrap();
        assert!(approx_eq(&output[..], &expected[..]), "{activation:?}");

        let derivative: Vec<f32> = expected
            .iter()
            .map(|&y| match activation {
                Activation::Sigmoid => y * (1.0 - y),
                Activation::Tanh => 1.0 - y * y,
                _ => {
                    if y > 0.0 {
                        1.0
                    } else {
                        0.0
                    }
                }
            })
            .collect();
        assert!(approx_eq(&gradient.download().unwrap()[..], &derivative[..]), "{activation:?}");
    }
}

#[test]
fn test_linear_activation_passes_through() {
    let Some(ctx) = common::gpu() else { return };

    let shape = Shape::vector(2);
    let spec = LayerSpec::Activation {
        shape,
        activation: Activation::Linear,
    };
    let mut layer = Layer::build(&ctx, &spec, true).unwrap();
    let input = common::tensor(&ctx, shape, &[1.0, -2.0]);

    let mut stream = ctx.command_stream("linear");
    let output = layer.forward(&mut stream, &input).unwrap();
    let gradient = layer.backward(&mut stream, &input, &input).unwrap();
    assert_eq!(stream.dispatches(), 0);
    stream.commit_and_wait().unwrap();

    assert!(output.aliases(&input));
    assert!(gradient.aliases(&input));
}

#[test]
fn test_reshape_layer_aliases() {
    let Some(ctx) = common::gpu() else { return };

    let spec = LayerSpec::Reshape {
        input: Shape::matrix(2, 2),
        output: Shape::vector(4),
    };
    let mut layer = Layer::build(&ctx, &spec, true).unwrap();
    let input = common::tensor(&ctx, Shape::matrix(2, 2), &[1.0, 2.0, 3.0, 4.0]);

    let mut stream = ctx.command_stream("reshape");
    let output = layer.forward(&mut stream, &input).unwrap();
    let back = layer.backward(&mut stream, &output, &input).unwrap();
    stream.commit_and_wait().unwrap();

    assert_eq!(output.shape(), Shape::vector(4));
    assert_eq!(back.shape(), Shape::matrix(2, 2));
    assert!(output.aliases(&input) && back.aliases(&input));
    assert_eq!(back.download().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn test_softmax_output() {
    let Some(ctx) = common::gpu() else { return };

    let mut network =
        Network::new(&ctx, vec![], OutputSpec::Softmax { shape: Shape::vector(3) }).unwrap();
    let out = network.feed_forward(&[1.0, 2.0, 3.0]).unwrap();

    let exps: Vec<f32> = [1.0f32, 2.0, 3.0].iter().map(|v| v.exp()).collect();
    let total: f32 = exps.iter().sum();
    let expected: Vec<f32> = exps.iter().map(|e| e / total).collect();
    assert!(approx_eq(&out[..], &expected[..]));
    assert!(approx_eq(&out.iter().sum::<f32>(), &1.0));

    // large logits stay finite thanks to the max shift
    let out = network.feed_forward(&[1000.0, 1000.0, 1000.0]).unwrap();
    assert!(all_close(&out, &[1.0 / 3.0; 3], 1e-5));

    let loss = network
        .train_one_sample(&Sample::new(vec![1.0, 2.0, 3.0], vec![0.0, 0.0, 1.0]))
        .unwrap();
    assert!(approx_eq(&loss, &-expected[2].ln()));
}

#[test]
fn test_softmax_classifier_learns() {
    let Some(ctx) = common::gpu() else { return };

    let mut network = Network::new(
        &ctx,
        vec![LayerSpec::Dense {
            inputs: 2,
            outputs: 2,
            weights: Some(vec![0.0; 6]),
        }],
        OutputSpec::Softmax { shape: Shape::vector(2) },
    )
    .unwrap();
    let samples = [
        Sample::new(vec![1.0, 0.0], vec![1.0, 0.0]),
        Sample::new(vec![0.0, 1.0], vec![0.0, 1.0]),
    ];
    let optimizer = Optimizer::Sgd { learning_rate: 0.5 };
    let mut state = OptimizerState::new();

    let first = network.train_batch(&samples, &optimizer, &mut state, None).unwrap();
    let mut last = first;
    for _ in 0..50 {
        last = network.train_batch(&samples, &optimizer, &mut state, None).unwrap();
    }
    assert!(last < first);
    let out = network.feed_forward(&[1.0, 0.0]).unwrap();
    assert!(out[0] > 0.9);
}

#[test]
fn test_inference_only_network_refuses_backward() {
    let Some(ctx) = common::gpu() else { return };

    let mut network =
        Network::inference_only(&ctx, vec![dense_2x2()], common::linear_output(2)).unwrap();
    assert!(!network.is_trainable());
    assert!(network.parameters().is_empty());
    assert!(approx_eq(&network.feed_forward(&[3.0, 4.0]).unwrap()[..], &[11.5, -2.0]));

    let err = network
        .train_one_sample(&Sample::new(vec![3.0, 4.0], vec![0.0, 0.0]))
        .unwrap_err();
    assert!(matches!(err, Error::BackwardUnavailable { .. }));

    let mut layer = Layer::build(&ctx, &dense_2x2(), false).unwrap();
    let input = DeviceTensor::allocate(&ctx, Shape::vector(2), Storage::Private, "in").unwrap();
    let mut stream = ctx.command_stream("inference");
    let output = layer.forward(&mut stream, &input).unwrap();
    let err = layer.backward(&mut stream, &output, &input).unwrap_err();
    assert!(matches!(err, Error::BackwardUnavailable { layer: "dense", .. }));
}

#[test]
fn test_layer_rejects_wrong_input_shape() {
    let Some(ctx) = common::gpu() else { return };

    let mut layer = Layer::build(&ctx, &dense_2x2(), true).unwrap();
    let input = DeviceTensor::allocate(&ctx, Shape::vector(3), Storage::Private, "wrong").unwrap();
    let mut stream = ctx.command_stream("wrong");
    assert!(matches!(
        layer.forward(&mut stream, &input),
        Err(Error::ShapeMismatch { .. })
    ));
}

#[test]
fn test_optimizer_zero_gradient_is_idempotent() {
    let Some(ctx) = common::gpu() else { return };

    for optimizer in all_optimizers() {
        let network = Network::new(&ctx, vec![dense_2x2()], common::linear_output(2)).unwrap();
        let before = network.parameters()[0].weights.download().unwrap();

        let mut state = OptimizerState::new();
        let mut stream = ctx.command_stream("zero gradient");
        optimizer.update(&mut stream, &network.parameters(), 1, &mut state).unwrap();
        stream.commit_and_wait().unwrap();

        let parameters = network.parameters();
        assert_eq!(parameters[0].weights.download().unwrap(), before, "{optimizer:?}");
        assert_eq!(parameters[0].gradient.download().unwrap(), vec![0.0; 6], "{optimizer:?}");
        assert_eq!(state.len(), usize::from(optimizer.accumulators() > 0), "{optimizer:?}");
    }
}

#[test]
fn test_optimizer_consumes_gradient() {
    let Some(ctx) = common::gpu() else { return };

    for optimizer in all_optimizers() {
        let mut network = common::line_network(&ctx, [0.0, 0.0]);
        let mut state = OptimizerState::new();
        network
            .train_batch(&common::line_samples(), &optimizer, &mut state, None)
            .unwrap();

        let parameters = network.parameters();
        let weights = parameters[0].weights.download().unwrap();
        assert!(weights.iter().all(|w| *w > 0.0), "{optimizer:?}: {weights:?}");
        assert_eq!(parameters[0].gradient.download().unwrap(), vec![0.0; 2], "{optimizer:?}");
    }
}

#[test]
fn test_gradient_accumulation_commutes() {
    let Some(ctx) = common::gpu() else { return };

    let a = Sample::new(vec![1.0, -2.0], vec![0.5, 1.0]);
    let b = Sample::new(vec![0.5, 3.0], vec![-1.0, 2.0]);
    let optimizer = Optimizer::Momentum {
        learning_rate: 0.05,
        momentum: 0.5,
    };

    let mut forward = Network::new(&ctx, vec![dense_2x2()], common::linear_output(2)).unwrap();
    let mut backward = Network::new(&ctx, vec![dense_2x2()], common::linear_output(2)).unwrap();
    let mut forward_state = OptimizerState::new();
    let mut backward_state = OptimizerState::new();

    forward
        .train_batch(&[a.clone(), b.clone()], &optimizer, &mut forward_state, None)
        .unwrap();
    backward
        .train_batch(&[b, a], &optimizer, &mut backward_state, None)
        .unwrap();

    let left = forward.parameters()[0].weights.download().unwrap();
    let right = backward.parameters()[0].weights.download().unwrap();
    assert!(all_close(&left, &right, 1e-5), "{left:?} vs {right:?}");
}

#[test]
fn test_failed_batch_discards_its_gradients() {
    let Some(ctx) = common::gpu() else { return };

    let mut network = common::line_network(&ctx, [0.0, 0.0]);
    let optimizer = Optimizer::Sgd { learning_rate: 0.2 };
    let mut state = OptimizerState::new();
    let good = Sample::new(vec![2.0], vec![2.5]);
    let bad = Sample::new(vec![1.0, 2.0], vec![2.0]);

    let err = network
        .train_batch(&[good.clone(), bad], &optimizer, &mut state, None)
        .unwrap_err();
    assert!(matches!(err, Error::ValueCount { .. }));

    let parameters = network.parameters();
    assert_eq!(parameters[0].gradient.download().unwrap(), vec![0.0; 2]);
    assert_eq!(parameters[0].weights.download().unwrap(), vec![0.0; 2]);

    // the next batch starts from its own gradient only
    network.train_batch(&[good], &optimizer, &mut state, None).unwrap();
    let weights = network.parameters()[0].weights.download().unwrap();
    assert!(approx_eq(&weights[..], &[1.0, 0.5]));
}

#[test]
fn test_regularization_shrinks_weights() {
    let Some(ctx) = common::gpu() else { return };

    let expected: Vec<f32> = [1.0f32, 2.0, 0.5, -1.0, 0.0, 1.0].iter().map(|w| w * 0.9).collect();

    // the shrink per update does not depend on the batch size
    for batch_size in [1, 3] {
        let network = Network::new(&ctx, vec![dense_2x2()], common::linear_output(2)).unwrap();
        let parameters = network.parameters();
        let mut stream = ctx.command_stream("regularize");
        Regularization { l1: 0.0, l2: 1.0 }
            .apply(&mut stream, &parameters, batch_size)
            .unwrap();
        Optimizer::Sgd { learning_rate: 0.1 }
            .update(&mut stream, &parameters, batch_size, &mut OptimizerState::new())
            .unwrap();
        stream.commit_and_wait().unwrap();

        let weights = parameters[0].weights.download().unwrap();
        assert!(approx_eq(&weights[..], &expected[..]), "batch {batch_size}: {weights:?}");
    }

    let network = Network::new(&ctx, vec![dense_2x2()], common::linear_output(2)).unwrap();
    let parameters = network.parameters();
    let mut stream = ctx.command_stream("bad regularization");
    assert!(matches!(
        Regularization { l1: -1.0, l2: 0.0 }.apply(&mut stream, &parameters, 1),
        Err(Error::InvalidConfig(_))
    ));
}

#[test]
fn test_optimizer_state_persists_accumulators() {
    let Some(ctx) = common::gpu() else { return };

    let mut network = common::line_network(&ctx, [0.0, 0.0]);
    let optimizer = Optimizer::AdaDelta {
        decay: 0.95,
        epsilon: 1e-6,
    };
    let mut state = OptimizerState::new();
    assert!(state.is_empty());

    let samples = common::line_samples();
    network.train_batch(&samples, &optimizer, &mut state, None).unwrap();
    network.train_batch(&samples, &optimizer, &mut state, None).unwrap();

    assert_eq!(state.len(), 1);
    let weights = network.parameters()[0].weights;
    let accumulators = state.get(weights).unwrap();
    assert_eq!(accumulators.len(), 2);
    assert!(accumulators[0].download().unwrap().iter().any(|v| *v > 0.0));
}

#[test]
fn test_linear_regression_converges() {
    let Some(ctx) = common::gpu() else { return };

    let mut network = common::line_network(&ctx, [0.0, 0.0]);
    let samples = common::line_samples();
    let optimizer = Optimizer::Sgd { learning_rate: 0.2 };
    let mut state = OptimizerState::new();

    let first = network.train_batch(&samples, &optimizer, &mut state, None).unwrap();
    let mut last = first;
    for _ in 0..300 {
        last = network.train_batch(&samples, &optimizer, &mut state, None).unwrap();
    }
    assert!(last < first);

    let weights = network.parameters()[0].weights.download().unwrap();
    assert!(all_close(&weights, &[0.5, 1.5], 0.05), "{weights:?}");
    assert!(all_close(&network.feed_forward(&[4.0]).unwrap(), &[3.5], 0.1));
}

#[test]
fn test_hidden_layers_learn_xor() {
    let Some(ctx) = common::gpu() else { return };

    let mut network = Network::new(
        &ctx,
        vec![
            LayerSpec::Dense {
                inputs: 2,
                outputs: 2,
                weights: Some(vec![1.0, 1.0, -0.5, 1.0, 1.0, -1.5]),
            },
            LayerSpec::Activation {
                shape: Shape::vector(2),
                activation: Activation::Sigmoid,
            },
            LayerSpec::dense(2, 1),
        ],
        OutputSpec::Activation {
            shape: Shape::vector(1),
            activation: Activation::Sigmoid,
        },
    )
    .unwrap();
    let samples = [
        Sample::new(vec![0.0, 0.0], vec![0.0]),
        Sample::new(vec![0.0, 1.0], vec![1.0]),
        Sample::new(vec![1.0, 0.0], vec![1.0]),
        Sample::new(vec![1.0, 1.0], vec![0.0]),
    ];
    let optimizer = Optimizer::Sgd { learning_rate: 2.0 };
    let mut state = OptimizerState::new();

    let first = network.train_batch(&samples, &optimizer, &mut state, None).unwrap();
    let mut last = first;
    for _ in 0..200 {
        last = network.train_batch(&samples, &optimizer, &mut state, None).unwrap();
    }
    assert!(last < first, "{first} -> {last}");
}

#[test]
fn test_weight_snapshot_and_restore() {
    let Some(ctx) = common::gpu() else { return };

    let mut network = Network::new(
        &ctx,
        vec![
            dense_2x2(),
            LayerSpec::Activation {
                shape: Shape::vector(2),
                activation: Activation::Relu,
            },
            LayerSpec::dense(2, 1),
        ],
        common::linear_output(1),
    )
    .unwrap();

    let mut snapshot = network.snapshot_weights().unwrap();
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot[0].layer, 0);
    assert_eq!(snapshot[0].kind, "dense");
    assert_eq!(snapshot[0].tensors[0].shape, Shape::matrix(3, 2));
    assert_eq!(snapshot[0].tensors[0].values, vec![1.0, 2.0, 0.5, -1.0, 0.0, 1.0]);
    assert_eq!(snapshot[1].layer, 2);

    snapshot[1].tensors[0].values = vec![1.0, 1.0, 0.0];
    network.restore_weights(&snapshot).unwrap();
    // relu([11.5, -2]) summed
    assert!(approx_eq(&network.feed_forward(&[3.0, 4.0]).unwrap()[..], &[11.5]));

    let mut transposed = snapshot.clone();
    transposed[1].tensors[0].shape = Shape::matrix(1, 3);
    assert!(matches!(network.restore_weights(&transposed), Err(Error::ShapeMismatch { .. })));

    let mut short = snapshot.clone();
    short[1].tensors[0].values = vec![5.0, 5.0];
    assert!(matches!(
        network.restore_weights(&short),
        Err(Error::ValueCount { expected: 3, found: 2, .. })
    ));

    let mut misplaced = snapshot.clone();
    misplaced[1].layer = 7;
    assert!(matches!(network.restore_weights(&misplaced), Err(Error::InvalidConfig(_))));

    // rejected snapshots leave the weights alone
    assert!(approx_eq(&network.feed_forward(&[3.0, 4.0]).unwrap()[..], &[11.5]));
}

#[test]
fn test_random_initialization_is_bounded() {
    let Some(ctx) = common::gpu() else { return };

    let network =
        Network::new(&ctx, vec![LayerSpec::dense(30, 20)], common::linear_output(20)).unwrap();
    let weights = network.parameters()[0].weights.download().unwrap();
    let bound = (6.0f32 / 50.0).sqrt();
    assert_eq!(weights.len(), 31 * 20);
    assert!(weights.iter().all(|w| w.abs() <= bound));
    assert!(weights.iter().any(|w| *w != 0.0));
}
