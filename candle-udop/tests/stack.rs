use std::collections::HashMap;

use candle::{DType, Device, IndexOp, Result, Tensor};
use candle_nn::{VarBuilder, VarMap};
use candle_udop::{
    BiasKind, Config, DecoderInput, DocumentInput, ForwardOptions, RelativeBiasArgs,
    UdopEncoderModel, UdopModel,
};

fn encoder(cfg: &Config) -> Result<UdopEncoderModel> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    UdopEncoderModel::load(vb, cfg)
}

fn boxes(b_sz: usize, seq_len: usize, dev: &Device) -> Result<Tensor> {
    let data: Vec<f32> = (0..b_sz * seq_len)
        .flat_map(|i| {
            let x = (i % 7) as f32 / 8.;
            let y = (i % 5) as f32 / 6.;
            [x, y, x + 0.1, y + 0.05]
        })
        .collect();
    Tensor::from_vec(data, (b_sz, seq_len, 4), dev)
}

#[test]
fn ids_and_embeddings_are_exclusive() -> Result<()> {
    let dev = &Device::Cpu;
    let cfg = Config::tiny();
    let model = encoder(&cfg)?;
    let ids = Tensor::new(&[[3u32, 4, 5]], dev)?;
    let embeds = Tensor::randn(0f32, 1., (1, 3, cfg.d_model), dev)?;
    let bbox = boxes(1, 3, dev)?;
    let opts = ForwardOptions::default();

    let both = DocumentInput {
        input_ids: Some(&ids),
        inputs_embeds: Some(&embeds),
        bbox: Some(&bbox),
        ..Default::default()
    };
    assert!(model.forward(&both, opts).is_err());
    let neither = DocumentInput {
        bbox: Some(&bbox),
        ..Default::default()
    };
    assert!(model.forward(&neither, opts).is_err());

    let from_embeds = DocumentInput {
        inputs_embeds: Some(&embeds),
        bbox: Some(&bbox),
        ..Default::default()
    };
    let out = model.forward(&from_embeds, opts)?;
    assert_eq!(out.last_hidden_state.dims(), &[1, 3, cfg.d_model]);
    Ok(())
}

#[test]
fn scalar_ids_are_rejected() -> Result<()> {
    let dev = &Device::Cpu;
    let model = encoder(&Config::tiny())?;
    let id = Tensor::new(3u32, dev)?;
    let bbox = boxes(1, 1, dev)?;
    let input = DocumentInput {
        input_ids: Some(&id),
        bbox: Some(&bbox),
        ..Default::default()
    };
    assert!(model.forward(&input, ForwardOptions::default()).is_err());
    Ok(())
}

#[test]
fn encoder_rejects_use_cache() -> Result<()> {
    let dev = &Device::Cpu;
    let model = encoder(&Config::tiny())?;
    let ids = Tensor::new(&[[3u32, 4, 5]], dev)?;
    let bbox = boxes(1, 3, dev)?;
    let input = DocumentInput {
        input_ids: Some(&ids),
        bbox: Some(&bbox),
        ..Default::default()
    };
    let opts = ForwardOptions {
        use_cache: true,
        ..Default::default()
    };
    assert!(model.forward(&input, opts).is_err());
    Ok(())
}

#[test]
fn image_inputs_are_checked() -> Result<()> {
    let dev = &Device::Cpu;
    let model = encoder(&Config::tiny())?;
    let ids = Tensor::new(&[[3u32, 4, 5]], dev)?;
    let bbox = boxes(1, 3, dev)?;
    let opts = ForwardOptions::default();

    let wrong_size = Tensor::randn(0f32, 1., (1, 3, 16, 16), dev)?;
    let input = DocumentInput {
        input_ids: Some(&ids),
        bbox: Some(&bbox),
        pixel_values: Some(&wrong_size),
        ..Default::default()
    };
    assert!(model.forward(&input, opts).is_err());

    let pixels = Tensor::randn(0f32, 1., (1, 3, 32, 32), dev)?;
    let no_boxes = DocumentInput {
        input_ids: Some(&ids),
        pixel_values: Some(&pixels),
        ..Default::default()
    };
    assert!(model.forward(&no_boxes, opts).is_err());

    // Layout biases need boxes even without an image.
    let text_only = DocumentInput {
        input_ids: Some(&ids),
        ..Default::default()
    };
    assert!(model.forward(&text_only, opts).is_err());
    Ok(())
}

#[test]
fn fused_mask_covers_the_visual_tail() -> Result<()> {
    let dev = &Device::Cpu;
    let cfg = Config::tiny();
    let model = encoder(&cfg)?;
    let ids = Tensor::new(&[[3u32, 4, 5, 0], [6, 7, 8, 9]], dev)?;
    let mask = Tensor::new(&[[1u32, 1, 1, 0], [1, 1, 1, 1]], dev)?;
    let bbox = boxes(2, 4, dev)?;
    let pixels = Tensor::randn(0f32, 1., (2, 3, 32, 32), dev)?;
    let input = DocumentInput {
        input_ids: Some(&ids),
        attention_mask: Some(&mask),
        bbox: Some(&bbox),
        pixel_values: Some(&pixels),
        ..Default::default()
    };
    let opts = ForwardOptions {
        output_hidden_states: true,
        output_attentions: true,
        ..Default::default()
    };
    let out = model.forward(&input, opts)?;
    assert_eq!(out.last_hidden_state.dims(), &[2, 20, cfg.d_model]);
    assert_eq!(out.attention_mask.dims(), &[2, 20]);
    assert_eq!(out.attention_mask.i((0, ..4))?.to_vec1::<u32>()?, [1, 1, 1, 0]);

    let hidden_states = out.hidden_states.unwrap();
    assert_eq!(hidden_states.len(), cfg.num_layers + 1);
    let attentions = out.attentions.unwrap();
    assert_eq!(attentions.len(), cfg.num_layers);
    assert_eq!(attentions[0].dims(), &[2, cfg.num_heads, 20, 20]);
    assert!(out.cross_attentions.is_none());

    let wrong_mask = Tensor::ones((2, 3), DType::U32, dev)?;
    let input = DocumentInput {
        attention_mask: Some(&wrong_mask),
        pixel_values: None,
        ..input
    };
    assert!(model.forward(&input, ForwardOptions::default()).is_err());
    Ok(())
}

#[test]
fn empty_batch_is_replaced_by_a_padded_one() -> Result<()> {
    let dev = &Device::Cpu;
    let cfg = Config {
        relative_bias_args: vec![RelativeBiasArgs::new(BiasKind::Sequence)],
        ..Config::tiny()
    };
    let model = encoder(&cfg)?;
    let ids = Tensor::zeros((1, 0), DType::U32, dev)?;
    let input = DocumentInput {
        input_ids: Some(&ids),
        ..Default::default()
    };
    let out = model.forward(&input, ForwardOptions::default())?;
    assert_eq!(out.last_hidden_state.dims(), &[4, 1024, cfg.d_model]);
    assert_eq!(out.attention_mask.dims(), &[4, 1024]);
    Ok(())
}

#[test]
fn pruned_encoder_still_runs() -> Result<()> {
    let dev = &Device::Cpu;
    let cfg = Config {
        num_heads: 8,
        d_kv: 4,
        ..Config::tiny()
    };
    let mut model = encoder(&cfg)?;
    let ids = Tensor::new(&[[3u32, 4, 5, 6, 7]], dev)?;
    let bbox = boxes(1, 5, dev)?;
    let input = DocumentInput {
        input_ids: Some(&ids),
        bbox: Some(&bbox),
        ..Default::default()
    };
    let heads = HashMap::from([(0, vec![2]), (1, vec![0, 5])]);
    model.prune_heads(&heads)?;
    let blocks = model.encoder().blocks();
    assert_eq!(blocks[0].self_attention().num_heads(), 7);
    assert!(blocks[0].self_attention().pruned_heads().contains(2));
    assert_eq!(blocks[1].self_attention().num_heads(), 6);

    let opts = ForwardOptions {
        output_attentions: true,
        ..Default::default()
    };
    let out = model.forward(&input, opts)?;
    assert_eq!(out.last_hidden_state.dims(), &[1, 5, cfg.d_model]);
    let attentions = out.attentions.unwrap();
    assert_eq!(attentions[0].dims(), &[1, 7, 5, 5]);
    assert_eq!(attentions[1].dims(), &[1, 6, 5, 5]);

    // A head mask is given over the original heads.
    let head_mask = Tensor::ones(8, DType::F32, dev)?;
    let masked = DocumentInput {
        head_mask: Some(&head_mask),
        ..input
    };
    model.forward(&masked, ForwardOptions::default())?;

    assert!(model.prune_heads(&HashMap::from([(5, vec![0])])).is_err());
    Ok(())
}

#[test]
fn head_mask_silences_heads() -> Result<()> {
    let dev = &Device::Cpu;
    let cfg = Config::tiny();
    let model = encoder(&cfg)?;
    let ids = Tensor::new(&[[3u32, 4, 5]], dev)?;
    let bbox = boxes(1, 3, dev)?;
    let head_mask = Tensor::new(&[[1f32, 0., 1., 1.], [0., 0., 0., 0.]], dev)?;
    let input = DocumentInput {
        input_ids: Some(&ids),
        bbox: Some(&bbox),
        head_mask: Some(&head_mask),
        ..Default::default()
    };
    let opts = ForwardOptions {
        output_attentions: true,
        ..Default::default()
    };
    let out = model.forward(&input, opts)?;
    let attentions = out.attentions.unwrap();
    let silenced = attentions[0].i((.., 1))?.abs()?.flatten_all()?.max(0)?;
    assert_eq!(silenced.to_scalar::<f32>()?, 0.);
    let all_silenced = attentions[1].abs()?.flatten_all()?.max(0)?;
    assert_eq!(all_silenced.to_scalar::<f32>()?, 0.);

    let wrong_layers = Tensor::ones((3, 4), DType::F32, dev)?;
    let input = DocumentInput {
        head_mask: Some(&wrong_layers),
        ..input
    };
    assert!(model.forward(&input, ForwardOptions::default()).is_err());
    Ok(())
}

#[test]
fn decoder_checks_its_cache() -> Result<()> {
    let dev = &Device::Cpu;
    let cfg = Config::tiny();
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, dev);
    let model = UdopModel::load(vb, &cfg)?;
    let ids = Tensor::new(&[[3u32, 4, 5]], dev)?;
    let bbox = boxes(1, 3, dev)?;
    let doc = DocumentInput {
        input_ids: Some(&ids),
        bbox: Some(&bbox),
        ..Default::default()
    };
    let decoder_ids = Tensor::new(&[[0u32]], dev)?;
    let dec = DecoderInput {
        input_ids: Some(&decoder_ids),
        ..Default::default()
    };
    let opts = ForwardOptions::new(&cfg);
    assert!(opts.use_cache);
    let no_cache = ForwardOptions::new(&Config {
        use_cache: false,
        ..Config::tiny()
    });
    assert!(!no_cache.use_cache);

    let encoder_out = model.encode(&doc, ForwardOptions::default())?;
    let mut wrong_layers = candle_udop::DecoderCache::new(cfg.decoder_layers() + 1, 4);
    let res = model.forward(&doc, &dec, Some(encoder_out.clone()), Some(&mut wrong_layers), opts);
    assert!(res.is_err());

    // Self-attention states only, while encoder states are given.
    let k = Tensor::zeros((1, cfg.num_heads, 1, cfg.d_kv), DType::F32, dev)?;
    let states = vec![vec![k.clone(), k.clone()]; cfg.decoder_layers()];
    let mut self_only = candle_udop::DecoderCache::from_states(&states, 4)?;
    let res = model.forward(&doc, &dec, Some(encoder_out.clone()), Some(&mut self_only), opts);
    assert!(res.is_err());

    let mut cache = model.new_cache(4);
    let out = model.forward(&doc, &dec, Some(encoder_out.clone()), Some(&mut cache), opts)?;
    assert_eq!(out.decoder.last_hidden_state.dims(), &[1, 1, cfg.d_model]);
    assert_eq!(cache.seq_len(), 1);

    // Caching turned off in the configuration leaves the cache untouched.
    let mut unused = model.new_cache(4);
    model.forward(&doc, &dec, Some(encoder_out), Some(&mut unused), no_cache)?;
    assert!(unused.is_empty());
    Ok(())
}
