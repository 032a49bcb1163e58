// exynos_camera - camera pipeline CLI
// Runs the controller against the in-process virtual device.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use exynos_camera::{
    camera_info, number_of_cameras, read_summary, summarize_jpeg, Callbacks, CameraConfig,
    ExynosCamera, MessageType, PreviewWindow, VirtualDevice, WindowBuffer,
};

#[derive(Parser)]
#[command(name = "exynos_camera", version, about = "Exynos FIMC camera pipeline controller")]
struct Args {
    /// Preset file (JSON); defaults to the built-in Galaxy S2 presets
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List cameras with facing and orientation
    List,

    /// Print the flattened parameters of a camera
    Params {
        #[arg(long, default_value_t = 0)]
        camera: usize,

        /// `key=value;...` applied before printing
        #[arg(long)]
        set: Option<String>,
    },

    /// Run preview, optional autofocus and one capture on the virtual device
    Capture {
        #[arg(long, default_value_t = 0)]
        camera: usize,

        #[arg(long, short)]
        output: PathBuf,

        /// `key=value` applied before capture, e.g. `picture-size=640x480`
        #[arg(long)]
        set: Vec<String>,

        /// Run an autofocus pass before capturing
        #[arg(long)]
        autofocus: bool,

        /// Preview frames to stream before capturing (0 skips preview)
        #[arg(long, default_value_t = 3)]
        preview_frames: usize,

        /// Seconds to wait for each stage
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },

    /// Summarize the EXIF block of a JPEG
    Inspect { path: PathBuf },
}

enum Event {
    Notify(MessageType, i32),
    Data(MessageType, Vec<u8>),
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<Event>, timeout: Duration) -> Result<Event> {
    tokio::time::timeout(timeout, events.recv())
        .await
        .context("Timed out waiting for the camera")?
        .context("Camera callbacks closed")
}

/// Preview surface that drops every frame.
#[derive(Default)]
struct DiscardWindow {
    geometry: (u32, u32),
    next_id: usize,
}

impl PreviewWindow for DiscardWindow {
    fn set_buffer_count(&mut self, _count: usize) -> exynos_camera::Result<()> {
        Ok(())
    }

    fn set_usage(&mut self, _usage: u32) -> exynos_camera::Result<()> {
        Ok(())
    }

    fn set_buffers_geometry(&mut self, width: u32, height: u32, _hal_format: u32) -> exynos_camera::Result<()> {
        self.geometry = (width, height);
        Ok(())
    }

    fn dequeue_buffer(&mut self) -> exynos_camera::Result<WindowBuffer> {
        self.next_id += 1;
        Ok(WindowBuffer {
            id: self.next_id,
            data: vec![0; (self.geometry.0 * self.geometry.1 * 2) as usize],
        })
    }

    fn enqueue_buffer(&mut self, _buffer: WindowBuffer) -> exynos_camera::Result<()> {
        Ok(())
    }

    fn cancel_buffer(&mut self, _buffer: WindowBuffer) -> exynos_camera::Result<()> {
        Ok(())
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<CameraConfig> {
    match path {
        Some(path) => CameraConfig::from_path(path)
            .with_context(|| format!("Failed to load presets from {}", path.display())),
        None => Ok(CameraConfig::galaxys2()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    let args = Args::parse();
    let config = Arc::new(load_config(args.config.as_ref())?);

    match args.command {
        Command::List => {
            for id in 0..number_of_cameras(&config) {
                let info = camera_info(&config, id)?;
                println!(
                    "{}: {} {:?} orientation {}",
                    id, config.presets[id].name, info.facing, info.orientation
                );
            }
        }

        Command::Params { camera, set } => {
            let device = Arc::new(VirtualDevice::new());
            let camera = ExynosCamera::open(config, camera, device)
                .context("Failed to open camera")?;
            if let Some(text) = set {
                camera.set_parameters(&text)?;
            }
            for pair in camera.get_parameters().split(';') {
                println!("{}", pair);
            }
        }

        Command::Capture { camera, output, set, autofocus, preview_frames, timeout } => {
            let device = Arc::new(VirtualDevice::new());
            let camera = ExynosCamera::open(config, camera, device.clone())
                .context("Failed to open camera")?;
            if !set.is_empty() {
                camera.set_parameters(&set.join(";"))?;
            }
            let timeout = Duration::from_secs(timeout);

            let (events_tx, mut events) = mpsc::unbounded_channel();
            let notify_tx = events_tx.clone();
            camera.set_callbacks(
                Callbacks::new()
                    .with_allocator(device.allocator())
                    .with_notify(move |msg, ext1, _| {
                        let _ = notify_tx.send(Event::Notify(msg, ext1));
                    })
                    .with_data(move |msg, block, _| {
                        let _ = events_tx.send(Event::Data(msg, block.to_vec()));
                    }),
            );
            camera.enable_msg_type(
                MessageType::FOCUS | MessageType::PREVIEW_FRAME | MessageType::COMPRESSED_IMAGE,
            );

            if preview_frames > 0 {
                camera.set_preview_window(Some(Box::new(DiscardWindow::default())))?;
                camera.start_preview().context("Failed to start preview")?;
                let mut seen = 0;
                while seen < preview_frames {
                    if let Event::Data(MessageType::PREVIEW_FRAME, _) = next_event(&mut events, timeout).await? {
                        seen += 1;
                    }
                }
                info!("streamed {} preview frames", seen);
            }

            if autofocus {
                camera.auto_focus().context("Failed to start autofocus")?;
                loop {
                    if let Event::Notify(MessageType::FOCUS, result) = next_event(&mut events, timeout).await? {
                        info!("autofocus {}", if result == 1 { "succeeded" } else { "failed" });
                        break;
                    }
                }
            }

            camera.take_picture().context("Failed to start capture")?;
            let jpeg = loop {
                if let Event::Data(MessageType::COMPRESSED_IMAGE, bytes) = next_event(&mut events, timeout).await? {
                    break bytes;
                }
            };

            std::fs::write(&output, &jpeg)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            info!("wrote {} bytes to {}", jpeg.len(), output.display());

            let summary = summarize_jpeg(&jpeg)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            println!("{}", serde_json::to_string_pretty(&camera.metrics())?);
        }

        Command::Inspect { path } => {
            let summary = read_summary(&path)
                .with_context(|| format!("Failed to read EXIF from {}", path.display()))?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            println!("{}", summary.exposure_summary());
        }
    }

    Ok(())
}
