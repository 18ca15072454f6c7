use candle::{DType, Device, IndexOp, Result, Tensor};
use candle_nn::{VarBuilder, VarMap};
use candle_udop::bias::{relative_position_bucket, AggregatedBias, BiasInput, RelativePositionBias};
use candle_udop::{BiasKind, Config, RelativeBiasArgs};

fn max_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    (a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()
}

fn boxes(dev: &Device) -> Result<Tensor> {
    Tensor::new(
        &[
            [
                [0.1f32, 0.1, 0.2, 0.15],
                [0.3, 0.1, 0.45, 0.15],
                [0.6, 0.4, 0.7, 0.45],
                [0.1, 0.8, 0.3, 0.85],
                [0.0, 0.0, 0.0, 0.0],
            ],
            [
                [0.5, 0.5, 0.6, 0.55],
                [0.2, 0.2, 0.4, 0.25],
                [0.9, 0.1, 0.95, 0.15],
                [0.4, 0.9, 0.5, 0.95],
                [1.0, 1.0, 1.0, 1.0],
            ],
        ],
        dev,
    )
}

#[test]
fn aggregated_bias_is_the_sum_of_its_parts() -> Result<()> {
    let dev = &Device::Cpu;
    let cfg = Config::tiny();
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, dev);
    let aggregated = AggregatedBias::load(&cfg, vb)?;
    assert_eq!(aggregated.biases().len(), 3);

    let bbox = boxes(dev)?;
    let input = BiasInput::new(2, 5, Some(&bbox));
    let total = aggregated.forward_t(&input, false)?;
    assert_eq!(total.dims(), &[2, cfg.num_heads, 5, 5]);

    let mut expected = Tensor::zeros((2, cfg.num_heads, 5, 5), DType::F32, dev)?;
    for bias in aggregated.biases() {
        let part = bias.forward_t(&input, false)?;
        match bias.kind() {
            BiasKind::Sequence => assert_eq!(part.dims(), &[1, cfg.num_heads, 5, 5]),
            _ => assert_eq!(part.dims(), &[2, cfg.num_heads, 5, 5]),
        }
        expected = expected.broadcast_add(&part)?;
    }
    assert!(max_diff(&total, &expected)? < 1e-6);
    Ok(())
}

#[test]
fn no_bias_configured_gives_zeros() -> Result<()> {
    let dev = &Device::Cpu;
    let mut cfg = Config::tiny();
    cfg.relative_bias_args.clear();
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, dev);
    let aggregated = AggregatedBias::load(&cfg, vb)?;
    let total = aggregated.forward_t(&BiasInput::new(3, 7, None), false)?;
    assert_eq!(total.dims(), &[1, cfg.num_heads, 7, 7]);
    assert_eq!(total.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?, 0.);
    Ok(())
}

#[test]
fn layout_distances_use_box_midpoints() -> Result<()> {
    let dev = &Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, dev);
    let horizontal = RelativePositionBias::load(&RelativeBiasArgs::new(BiasKind::Horizontal), 4, vb.pp("h"))?;
    let vertical = RelativePositionBias::load(&RelativeBiasArgs::new(BiasKind::Vertical), 4, vb.pp("v"))?;
    let bbox = boxes(dev)?;
    let input = BiasInput::new(2, 5, Some(&bbox));

    // Token 1 sits 0.225 to the right of token 0: 22 units after scaling.
    let h = horizontal.bucket_ids(&input, false)?.to_vec3::<u32>()?;
    let expected = candle_udop::bias::relative_position_bucket(22, true, 32, 100);
    assert_eq!(h[0][0][1], expected);
    assert_eq!(h[0][0][0], 0);
    // Tokens 0 and 1 share a line.
    let v = vertical.bucket_ids(&input, false)?.to_vec3::<u32>()?;
    assert_eq!(v[0][0][1], 0);
    assert_ne!(v[0][0][3], 0);

    assert!(horizontal.forward_t(&BiasInput::new(2, 5, None), false).is_err());
    Ok(())
}

#[test]
fn prefix_buckets_mark_the_prefix_region() -> Result<()> {
    let dev = &Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, dev);
    let args = RelativeBiasArgs {
        prefix_bucket: true,
        ..RelativeBiasArgs::new(BiasKind::Sequence)
    };
    let bias = RelativePositionBias::load(&args, 4, vb)?;
    assert_eq!(bias.table().dims(), &[34, 4]);

    // Two prefix tokens in the first example, one in the second.
    let bbox = Tensor::new(
        &[
            [[0f32, -1., 0., -1.], [0., -1., 0., -1.], [0.1, 0.1, 0.2, 0.2], [0.3, 0.1, 0.4, 0.2]],
            [[0f32, -1., 0., -1.], [0.1, 0.1, 0.2, 0.2], [0.3, 0.1, 0.4, 0.2], [0.5, 0.1, 0.6, 0.2]],
        ],
        dev,
    )?;
    let input = BiasInput::new(2, 4, Some(&bbox));
    assert_eq!(input.prefix_lengths()?, [2, 1]);
    let ids = bias.bucket_ids(&input, false)?.to_vec3::<u32>()?;
    assert_eq!(ids[0][0][2], 32);
    assert_eq!(ids[0][1][3], 32);
    assert_eq!(ids[0][2][0], 33);
    assert_eq!(ids[0][3][1], 33);
    // Inside each region the plain sequence buckets apply.
    assert_eq!(ids[0][0][1], 17);
    assert_eq!(ids[0][3][2], 1);
    assert_eq!(ids[1][0][1], 32);
    assert_eq!(ids[1][1][0], 33);
    assert_eq!(ids[1][1][2], 17);
    Ok(())
}

#[test]
fn expand_migrates_the_stored_table() -> Result<()> {
    let dev = &Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, dev);
    let old = vb.get((32, 4), "weight")?;
    let args = RelativeBiasArgs {
        prefix_bucket: true,
        expand: true,
        ..RelativeBiasArgs::new(BiasKind::Sequence)
    };
    let bias = RelativePositionBias::load(&args, 4, vb)?;
    let table = bias.table();
    assert_eq!(table.dims(), &[34, 4]);
    assert_eq!(max_diff(&table.i(..32)?, &old)?, 0.);
    let new_rows = table.i(32..)?.flatten_all()?.to_vec1::<f32>()?;
    assert!(new_rows.iter().all(|&v| (v - 0.1).abs() < 1e-7));
    Ok(())
}

#[test]
fn misconfigured_scaling_is_rejected() {
    let mut cfg = Config::tiny();
    cfg.relative_bias_args[0].scaling_factor = Some(2.0);
    assert!(cfg.validate().is_err());

    let mut cfg = Config::tiny();
    cfg.relative_bias_args[1].scaling_factor = Some(1.0);
    assert!(cfg.validate().is_err());

    let mut cfg = Config::tiny();
    cfg.relative_bias_args[2].num_heads = Some(cfg.num_heads + 1);
    assert!(cfg.validate().is_err());
}

#[test]
fn augmentation_rescales_layout_distances_while_training() -> Result<()> {
    let dev = &Device::Cpu;
    let args = RelativeBiasArgs {
        augmentation: true,
        ..RelativeBiasArgs::new(BiasKind::Horizontal)
    };
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, dev);
    let bias = RelativePositionBias::load(&args, 4, vb)?;
    // Horizontal midpoints 0.1 and 0.5.
    let bbox = Tensor::new(&[[[0.0f32, 0.1, 0.2, 0.2], [0.4, 0.1, 0.6, 0.2]]], dev)?;
    let input = BiasInput::new(1, 2, Some(&bbox));

    let bucket = |rel: i64| {
        relative_position_bucket(rel, args.bidirectional, args.relative_attention_num_buckets, args.max_distance())
    };
    let scale = args.scaling_factor();
    let d = 0.4 * scale;
    // One step of slack on each side for the float truncation.
    let bounds = |sign: f64| {
        let a = bucket((sign * (0.8 * d - 1.)) as i64);
        let b = bucket((sign * (1.25 * d + 1.)) as i64);
        (a.min(b), a.max(b))
    };
    let (fwd_lo, fwd_hi) = bounds(1.);
    let (bwd_lo, bwd_hi) = bounds(-1.);
    for _ in 0..32 {
        let ids = bias.bucket_ids(&input, true)?.i(0)?.to_vec2::<u32>()?;
        assert_eq!(ids[0][0], bucket(0));
        assert_eq!(ids[1][1], bucket(0));
        assert!((fwd_lo..=fwd_hi).contains(&ids[0][1]), "{ids:?}");
        assert!((bwd_lo..=bwd_hi).contains(&ids[1][0]), "{ids:?}");
    }

    let eval = bias.bucket_ids(&input, false)?.i(0)?.to_vec2::<u32>()?;
    for _ in 0..4 {
        assert_eq!(bias.bucket_ids(&input, false)?.i(0)?.to_vec2::<u32>()?, eval);
    }
    let exact = (bucket(d as i64 - 1), bucket(d as i64));
    assert!(eval[0][1] == exact.0 || eval[0][1] == exact.1, "{eval:?}");
    Ok(())
}
