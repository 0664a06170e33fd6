use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use stable_diffusion_sprite_gen as client;
use tracing_subscriber::EnvFilter;

/// Command-line client for a Stable Diffusion web UI-style generation engine.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// The URL of the engine to connect to
    #[arg(long, default_value = "http://127.0.0.1:7860")]
    url: String,

    #[arg(short, long)]
    username: Option<String>,

    #[arg(short, long)]
    password: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate an image from a text prompt
    Generate {
        #[command(flatten)]
        params: GenerationParams,

        /// Rewrite the prompt through a chat-completion API before
        /// generating (requires OPENAI_API_KEY; failures fall back to the
        /// prompt as written)
        #[arg(long)]
        refine: bool,
    },
    /// Generate a variation of a source image, optionally guided by a
    /// ControlNet conditioning image
    Variate {
        /// Source image to vary
        image: PathBuf,

        #[command(flatten)]
        params: GenerationParams,

        /// How far the result may diverge from the source (0..=1)
        #[arg(long, default_value_t = 0.75)]
        denoising: f64,

        /// Precomputed conditioning image, e.g. a pose skeleton
        #[arg(long, conflicts_with = "canny")]
        pose: Option<PathBuf>,

        /// Derive the conditioning image from the source via Canny edges
        #[arg(long)]
        canny: bool,

        /// Exact conditioning-model identifier, as reported by `models`
        #[arg(long)]
        controlnet_model: Option<String>,

        /// Weight of the conditioning unit
        #[arg(long, default_value_t = 1.0)]
        weight: f32,

        /// Let the conditioning image win over the prompt
        #[arg(long)]
        controlnet_priority: bool,

        /// Also write the derived edge map here
        #[arg(long)]
        preview_edges: Option<PathBuf>,
    },
    /// Regenerate only the masked region of a source image
    Inpaint {
        /// Source image to edit
        image: PathBuf,

        /// Overlay whose non-transparent pixels mark the region to edit;
        /// must match the source image's dimensions
        mask: PathBuf,

        #[command(flatten)]
        params: GenerationParams,

        #[arg(long, default_value_t = 0.75)]
        denoising: f64,

        #[arg(long, default_value_t = 4)]
        mask_blur: u32,

        /// Restrict sampling to the masked region at full resolution
        #[arg(long)]
        full_res: bool,
    },
    /// List the conditioning models the engine has installed
    Models,
}

#[derive(Args)]
struct GenerationParams {
    #[arg(long, default_value = "1 character, full body, best quality, solo, white background")]
    prompt: String,

    #[arg(long, default_value = "monochrome, lowres, bad anatomy, worst quality, blurry")]
    negative_prompt: String,

    #[arg(long, default_value_t = 20)]
    steps: u32,

    #[arg(long, default_value_t = 7.0)]
    cfg_scale: f64,

    #[arg(long, default_value_t = 512)]
    width: u32,

    #[arg(long, default_value_t = 512)]
    height: u32,

    #[arg(long)]
    seed: Option<i64>,

    /// Where to write the result; defaults to a timestamped PNG
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("sdgen_client=info,stable_diffusion_sprite_gen=info")
            }),
        )
        .init();

    let cli = Cli::parse();
    let engine = client::Client::new(
        &cli.url,
        cli.username.as_deref().zip(cli.password.as_deref()),
    )
    .await?;

    match cli.command {
        Command::Generate { params, refine } => {
            let prompt = if refine {
                refine_prompt(&params.prompt).await?
            } else {
                params.prompt.clone()
            };
            let request = client::TextToImageRequest {
                prompt,
                negative_prompt: params.negative_prompt.clone(),
                steps: params.steps,
                cfg_scale: params.cfg_scale,
                width: params.width,
                height: params.height,
                seed: params.seed,
                ..Default::default()
            };
            let result = engine.txt2img(&request).await?;
            save_result(&result.image, params.output.as_deref())?;
        }
        Command::Variate {
            image,
            params,
            denoising,
            pose,
            canny,
            controlnet_model,
            weight,
            controlnet_priority,
            preview_edges,
        } => {
            let source = load_image(&image)?;
            let mut request = client::ImageToImageRequest::new(source);
            apply_params(&mut request, &params);
            request.denoising_strength = denoising;
            request.controlnet = controlnet_unit(
                pose.as_deref(),
                canny,
                controlnet_model,
                weight,
                controlnet_priority,
            )?;

            let result = engine.img2img(&request).await?;
            save_result(&result.image, params.output.as_deref())?;
            if let (Some(path), Some(edges)) = (preview_edges, result.preview) {
                edges
                    .save(&path)
                    .with_context(|| format!("failed to write edge preview to {}", path.display()))?;
                tracing::info!(path = %path.display(), "wrote edge preview");
            }
        }
        Command::Inpaint {
            image,
            mask,
            params,
            denoising,
            mask_blur,
            full_res,
        } => {
            let source = load_image(&image)?;
            let overlay = load_image(&mask)?;
            let mut request = client::ImageToImageRequest::new(source);
            apply_params(&mut request, &params);
            request.denoising_strength = denoising;
            request.mask_overlay = Some(overlay);
            request.mask_blur = mask_blur;
            request.inpaint_full_res = full_res;

            let result = engine.img2img(&request).await?;
            save_result(&result.image, params.output.as_deref())?;
        }
        Command::Models => {
            for model in engine.controlnet_model_list().await? {
                println!("{model}");
            }
        }
    }

    Ok(())
}

fn apply_params(request: &mut client::ImageToImageRequest, params: &GenerationParams) {
    request.prompt = params.prompt.clone();
    request.negative_prompt = params.negative_prompt.clone();
    request.steps = params.steps;
    request.cfg_scale = params.cfg_scale;
    request.width = params.width;
    request.height = params.height;
    request.seed = params.seed;
}

fn controlnet_unit(
    pose: Option<&Path>,
    canny: bool,
    model: Option<String>,
    weight: f32,
    controlnet_priority: bool,
) -> anyhow::Result<Option<client::ControlNetUnit>> {
    let unit = match (pose, canny) {
        (Some(path), _) => {
            let model = model.context("--pose requires --controlnet-model")?;
            client::ControlNetUnit::from_image(load_image(path)?, model)
        }
        (None, true) => {
            let model = model.context("--canny requires --controlnet-model")?;
            client::ControlNetUnit::canny_from_source(model)
        }
        (None, false) => return Ok(None),
    };
    let mode = if controlnet_priority {
        client::ControlMode::ControlNetImportant
    } else {
        client::ControlMode::Balanced
    };
    Ok(Some(unit.with_weight(weight).with_control_mode(mode)))
}

async fn refine_prompt(raw: &str) -> anyhow::Result<String> {
    let api_key =
        std::env::var("OPENAI_API_KEY").context("--refine requires OPENAI_API_KEY to be set")?;
    let refiner = client::PromptRefiner::new(api_key)?;
    let refined = refiner.refine(raw).await;
    tracing::info!(%refined, "using prompt");
    Ok(refined)
}

fn load_image(path: &Path) -> anyhow::Result<image::DynamicImage> {
    image::open(path).with_context(|| format!("failed to open image {}", path.display()))
}

fn save_result(image: &image::DynamicImage, output: Option<&Path>) -> anyhow::Result<()> {
    let path = match output {
        Some(path) => path.to_owned(),
        None => PathBuf::from(format!(
            "sdgen-{}.png",
            chrono::Local::now().format("%Y%m%d-%H%M%S")
        )),
    };
    image
        .save(&path)
        .with_context(|| format!("failed to write result to {}", path.display()))?;
    tracing::info!(path = %path.display(), "wrote result");
    Ok(())
}
