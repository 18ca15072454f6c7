use std::io::Write;

use anyhow::{anyhow, Error as E, Result};
use candle::{DType, Device, IndexOp, Tensor, D};
use candle_nn::VarBuilder;
use candle_udop::{Config, DecoderInput, DocumentInput, ForwardOptions, UdopForConditionalGeneration};
use clap::Parser;
use hf_hub::{api::sync::Api, Cache, Repo, RepoType};
use tokenizers::Tokenizer;

const DEFAULT_QUESTION: &str = "What is the date on the letter?";

/// One OCR word with its box in 0..1000 page coordinates.
#[derive(Debug, serde::Deserialize)]
struct Word {
    text: String,
    #[serde(rename = "box")]
    bbox: [f32; 4],
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,

    /// Run offline (you must have the files already cached)
    #[arg(long)]
    offline: bool,

    /// Enable tracing (generates a trace-timestamp.json file).
    #[arg(long)]
    tracing: bool,

    #[arg(long)]
    model_id: Option<String>,

    #[arg(long)]
    revision: Option<String>,

    /// A local tokenizer.json, used instead of the one from the hub.
    #[arg(long)]
    tokenizer: Option<String>,

    /// The page image.
    #[arg(long)]
    image: String,

    /// The OCR of the page, a JSON list of `{"text": .., "box": [x0, y0, x1, y1]}`
    /// with coordinates in 0..1000.
    #[arg(long)]
    words: String,

    #[arg(long)]
    question: Option<String>,

    /// The maximum number of generated tokens.
    #[arg(long, default_value_t = 32)]
    max_tokens: usize,
}

fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else {
        let device = Device::cuda_if_available(0)?;
        if !device.is_cuda() {
            println!("Running on CPU, to run on GPU, build this example with `--features cuda`");
        }
        Ok(device)
    }
}

impl Args {
    fn build_model_and_tokenizer(
        &self,
        device: &Device,
    ) -> Result<(UdopForConditionalGeneration, Config, Tokenizer)> {
        let default_model = "microsoft/udop-large".to_string();
        let default_revision = "main".to_string();
        let (model_id, revision) = match (self.model_id.to_owned(), self.revision.to_owned()) {
            (Some(model_id), Some(revision)) => (model_id, revision),
            (Some(model_id), None) => (model_id, default_revision),
            (None, Some(revision)) => (default_model, revision),
            (None, None) => (default_model, default_revision),
        };

        let repo = Repo::with_revision(model_id, RepoType::Model, revision);
        let (config_filename, tokenizer_filename, weights_filename) = if self.offline {
            let cache = Cache::default().repo(repo);
            (
                cache
                    .get("config.json")
                    .ok_or(anyhow!("Missing config file in cache"))?,
                cache.get("tokenizer.json"),
                cache
                    .get("model.safetensors")
                    .ok_or(anyhow!("Missing weights file in cache"))?,
            )
        } else {
            let api = Api::new()?;
            let api = api.repo(repo);
            let tokenizer = match self.tokenizer {
                Some(_) => None,
                None => Some(api.get("tokenizer.json")?),
            };
            (api.get("config.json")?, tokenizer, api.get("model.safetensors")?)
        };
        let tokenizer_filename = match (&self.tokenizer, tokenizer_filename) {
            (Some(tokenizer), _) => std::path::PathBuf::from(tokenizer),
            (None, Some(tokenizer)) => tokenizer,
            (None, None) => anyhow::bail!("Missing tokenizer file in cache"),
        };
        let config = std::fs::read_to_string(config_filename)?;
        let config: Config = serde_json::from_str(&config)?;
        let tokenizer = Tokenizer::from_file(tokenizer_filename).map_err(E::msg)?;

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights_filename], DType::F32, device)? };
        let model = UdopForConditionalGeneration::load(vb, &config)?;
        Ok((model, config, tokenizer))
    }
}

/// Resizes the page to `image_size` and normalizes it with mean and std 0.5.
fn load_image<T: AsRef<std::path::Path>>(path: T, image_size: usize) -> Result<Tensor> {
    let img = image::ImageReader::open(path)?.decode()?;
    let img = img.resize_exact(
        image_size as u32,
        image_size as u32,
        image::imageops::FilterType::Triangle,
    );
    let img = img.to_rgb8().into_raw();
    let img = Tensor::from_vec(img, (image_size, image_size, 3), &Device::Cpu)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(2. / 255., -1.)?;
    Ok(img)
}

/// Token ids and normalized boxes of the prompt followed by the page words.
/// Prompt tokens get an empty box and the final eos token a full-page one.
fn encode_document(
    tokenizer: &Tokenizer,
    question: &str,
    words: &[Word],
    eos_token_id: u32,
) -> Result<(Vec<u32>, Vec<[f32; 4]>)> {
    let mut ids = Vec::new();
    let mut boxes = Vec::new();
    let prompt = format!("Question answering. {question}");
    let prompt = tokenizer.encode(prompt, false).map_err(E::msg)?;
    for &id in prompt.get_ids() {
        ids.push(id);
        boxes.push([0., 0., 0., 0.]);
    }
    for word in words {
        let tokens = tokenizer.encode(word.text.as_str(), false).map_err(E::msg)?;
        let bbox = word.bbox.map(|v| (v / 1000.).clamp(0., 1.));
        for &id in tokens.get_ids() {
            ids.push(id);
            boxes.push(bbox);
        }
    }
    ids.push(eos_token_id);
    boxes.push([1., 1., 1., 1.]);
    Ok((ids, boxes))
}

fn main() -> Result<()> {
    use tracing_chrome::ChromeLayerBuilder;
    use tracing_subscriber::prelude::*;

    let args = Args::parse();
    let _guard = if args.tracing {
        println!("tracing...");
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        tracing_subscriber::registry().with(chrome_layer).init();
        Some(guard)
    } else {
        None
    };
    let device = device(args.cpu)?;
    let start = std::time::Instant::now();
    let (model, config, tokenizer) = args.build_model_and_tokenizer(&device)?;

    let words: Vec<Word> = serde_json::from_str(&std::fs::read_to_string(&args.words)?)?;
    let question = args.question.as_deref().unwrap_or(DEFAULT_QUESTION);
    let (ids, boxes) = encode_document(&tokenizer, question, &words, config.eos_token_id)?;
    let seq_len = ids.len();
    let input_ids = Tensor::new(ids, &device)?.unsqueeze(0)?;
    let bbox = Tensor::new(boxes.concat(), &device)?.reshape((1, seq_len, 4))?;
    let pixel_values = load_image(&args.image, config.image_size)?
        .unsqueeze(0)?
        .to_device(&device)?;
    println!("loaded the model and the document in {:?}", start.elapsed());

    let start = std::time::Instant::now();
    let document = DocumentInput {
        input_ids: Some(&input_ids),
        bbox: Some(&bbox),
        pixel_values: Some(&pixel_values),
        ..Default::default()
    };
    let encoder_output = model.encode(&document, ForwardOptions::default())?;

    let opts = ForwardOptions::new(&config);
    let mut cache = model.new_cache(args.max_tokens + 1);
    let mut output_ids = vec![config.decoder_start_token_id];
    for _ in 0..args.max_tokens {
        let decoder_ids = Tensor::new(output_ids.as_slice(), &device)?.unsqueeze(0)?;
        let decoder_ids = model.prepare_inputs_for_generation(&decoder_ids, Some(&cache))?;
        let decoder_input = DecoderInput {
            input_ids: Some(&decoder_ids),
            ..Default::default()
        };
        let (logits, _) = model.decode(&decoder_input, &encoder_output, Some(&mut cache), opts)?;
        let next_token = logits
            .i((0, logits.dim(1)? - 1))?
            .argmax(D::Minus1)?
            .to_scalar::<u32>()?;
        if next_token == config.eos_token_id {
            break;
        }
        output_ids.push(next_token);
        if let Some(text) = tokenizer.id_to_token(next_token) {
            let text = text.replace('▁', " ").replace("<0x0A>", "\n");
            print!("{text}");
            std::io::stdout().flush()?;
        }
    }
    let dt = start.elapsed();
    let answer = tokenizer.decode(&output_ids[1..], true).map_err(E::msg)?;
    println!(
        "\n{} tokens generated ({:.2} token/s)\nanswer: {answer}",
        output_ids.len() - 1,
        (output_ids.len() - 1) as f64 / dt.as_secs_f64(),
    );
    Ok(())
}
