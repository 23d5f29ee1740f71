//! CLI entry point for live-nx-iree.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use live_nx_iree::cli::{Cli, Commands, EngineArgs};
use live_nx_iree::codec;
use live_nx_iree::config::Config;
use live_nx_iree::source::FrameDirectory;
use live_nx_iree::{
    Bridge, BytecodeModule, CameraBinding, ElementType, FunctionBinding, Image, NativeEngine,
    SeedPolicy, Tensor,
};

/// One tensor in a JSON input file.
///
/// Expected format: `{ "type": "f32", "shape": [4], "data": [...] }`
#[derive(Debug, Deserialize)]
struct TensorInput {
    #[serde(rename = "type")]
    element_type: String,
    shape: Vec<usize>,
    data: Vec<f64>,
}

fn load_config(args: &EngineArgs) -> Result<Config> {
    match &args.config {
        Some(path) => Config::from_yaml_file(path)
            .with_context(|| format!("Failed to load config: {}", path.display())),
        None => Ok(Config::default()),
    }
}

fn load_engine(args: &EngineArgs, config: &Config) -> Result<NativeEngine> {
    let library = match (&args.library, &config.engine.library_path) {
        (Some(path), _) => path.clone(),
        (None, Some(path)) => PathBuf::from(path),
        (None, None) => bail!("No engine library given; pass --library or set engine.library_path"),
    };

    info!("Loading engine: {}", library.display());
    NativeEngine::load(&library)
        .with_context(|| format!("Failed to load engine: {}", library.display()))
}

fn read_bytecode(path: &Path) -> Result<BytecodeModule> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read bytecode: {}", path.display()))?;
    let module = codec::decode_bytecode(&text)?;
    info!("Loaded {} bytes of bytecode", module.len());
    Ok(module)
}

fn read_inputs(path: &Path) -> Result<Vec<Tensor>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read input: {}", path.display()))?;
    let inputs: Vec<TensorInput> = serde_json::from_str(&content)
        .with_context(|| format!("Input must be a list of tensors: {}", path.display()))?;

    inputs
        .into_iter()
        .enumerate()
        .map(|(i, input)| {
            let element_type: ElementType = input.element_type.parse()?;
            Tensor::from_f64_values(element_type, input.shape, &input.data)
                .with_context(|| format!("Invalid input {}", i))
        })
        .collect()
}

fn tensor_json(index: usize, tensor: &Tensor, encoded: &str) -> Value {
    serde_json::json!({
        "index": index,
        "type": tensor.element_type().to_string(),
        "shape": tensor.shape(),
        "byte_size": tensor.byte_len(),
        "base64": encoded,
        "values": tensor.to_f64_vec(),
    })
}

fn print_json(output: &Value, format: &str) -> Result<()> {
    if format == "pretty" {
        println!("{}", serde_json::to_string_pretty(output)?);
    } else {
        println!("{}", serde_json::to_string(output)?);
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse_args();

    // Initialize logging
    FmtSubscriber::builder()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .with_target(false)
        .init();

    match cli.command {
        Commands::Devices { engine, driver } => {
            let config = load_config(&engine)?;
            let native = load_engine(&engine, &config)?;
            let (bridge, _events) = Bridge::new(native);

            let directory = bridge.mount()?;
            let devices: Vec<&str> = match &driver {
                Some(driver) => directory.for_driver(driver).collect(),
                None => directory.uris().iter().map(String::as_str).collect(),
            };
            info!("Found {} devices", devices.len());

            print_json(&serde_json::json!({ "devices": devices }), "pretty")?;
            bridge.unmount();
        }

        Commands::Call {
            engine,
            bytecode,
            device,
            input,
            encoded,
            num_outputs,
            signature,
            format,
        } => {
            let config = load_config(&engine)?;
            let native = load_engine(&engine, &config)?;
            let (bridge, _events) = Bridge::new(native);
            bridge.mount()?;

            let uri = device.unwrap_or(config.device.uri);
            let num_outputs = num_outputs.unwrap_or(config.invocation.num_outputs);
            info!("Using device: {}", uri);

            let mut function = FunctionBinding::new(bridge.clone());
            if let Some(signature) = signature {
                function.set_signature(signature)?;
            }
            function.set_num_outputs(num_outputs)?;
            function.set_device(&uri)?;
            function.set_module(read_bytecode(&bytecode)?)?;

            info!("Running function...");
            let result = match input {
                Some(path) => function.set_input_tensors(read_inputs(&path)?)?,
                None => function.set_inputs(&encoded)?,
            }
            .context("Function did not run")?;

            info!(
                "Call complete: {} outputs in {:.2}ms",
                result.outputs.len(),
                result.latency_ms
            );

            let encoded_outputs = result.encode();
            let output = serde_json::json!({
                "num_outputs": result.outputs.len(),
                "latency_ms": result.latency_ms,
                "output_byte_sizes": result.output_byte_sizes(),
                "outputs": result
                    .outputs
                    .iter()
                    .zip(&encoded_outputs)
                    .enumerate()
                    .map(|(i, (t, e))| tensor_json(i, t, e))
                    .collect::<Vec<_>>(),
            });
            print_json(&output, &format)?;
            bridge.unmount();
        }

        Commands::Image {
            engine,
            bytecode,
            device,
            input,
            output,
            width,
            height,
            seed,
            noise,
        } => {
            let config = load_config(&engine)?;
            let native = load_engine(&engine, &config)?;
            let module = read_bytecode(&bytecode)?;
            let (bridge, _events) = Bridge::new(native);
            bridge.mount()?;
            bridge.select_device(&device.unwrap_or(config.device.uri))?;

            let width = width.unwrap_or(config.capture.width);
            let height = height.unwrap_or(config.capture.height);
            let seed = match seed.or(config.capture.seed) {
                Some(seed) => seed,
                None => SeedPolicy::Random.next_seed(),
            };
            let noise = noise.unwrap_or(config.capture.noise_amount);

            let source = Image::load(&input)
                .with_context(|| format!("Failed to read image: {}", input.display()))?;
            let resized = codec::tensor_to_image(
                &codec::image_to_tensor(&source, width, height)?,
                width,
                height,
            )?;

            info!(seed, noise, "Running image call at {}x{}", width, height);
            let result = bridge.invoke_image(&module, &resized, seed, noise)?;
            result
                .save(&output)
                .with_context(|| format!("Failed to write image: {}", output.display()))?;
            info!("Wrote {}", output.display());
            bridge.unmount();
        }

        Commands::Capture {
            engine,
            bytecode,
            device,
            frames,
            output_dir,
            count,
            interval_ms,
            noise,
            seed,
        } => {
            let mut config = load_config(&engine)?;
            if let Some(interval_ms) = interval_ms {
                config.capture.tick_interval_ms = interval_ms;
            }
            if let Some(noise) = noise {
                config.capture.noise_amount = noise;
            }
            if seed.is_some() {
                config.capture.seed = seed;
            }
            config.validate()?;

            let native = load_engine(&engine, &config)?;
            let module = read_bytecode(&bytecode)?;
            let source = Arc::new(FrameDirectory::open(&frames)?);
            fs::create_dir_all(&output_dir)
                .with_context(|| format!("Failed to create {}", output_dir.display()))?;

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to start async runtime")?;

            let (bridge, _events) = Bridge::new(native);
            bridge.mount()?;

            let mut camera =
                CameraBinding::new(bridge.clone(), runtime.handle().clone(), source, &config.capture)?;
            let mut published = camera.subscribe();
            camera.set_device(&device.unwrap_or(config.device.uri.clone()))?;
            camera.set_module(module)?;

            let stall = config.capture.frame_timeout() + Duration::from_secs(10);
            let written = runtime.block_on(async {
                let mut written = 0;
                while written < count {
                    match tokio::time::timeout(stall, published.changed()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) => break,
                        Err(_) => bail!("No frame published for {:?}", stall),
                    }
                    let frame = published.borrow_and_update().clone();
                    if let Some(frame) = frame {
                        let path = output_dir.join(format!("frame_{:05}.png", written));
                        frame.save(&path)?;
                        written += 1;
                    }
                }
                Ok::<_, anyhow::Error>(written)
            })?;

            camera.stop();
            let stats = camera.stats();
            info!(
                written,
                ticks = stats.ticks,
                failed = stats.failed,
                skipped = stats.skipped,
                "Capture finished"
            );

            print_json(
                &serde_json::json!({
                    "written": written,
                    "ticks": stats.ticks,
                    "completed": stats.completed,
                    "failed": stats.failed,
                    "skipped": stats.skipped,
                    "discarded": stats.discarded,
                }),
                "pretty",
            )?;
            drop(camera);
            bridge.unmount();
        }
    }

    Ok(())
}
