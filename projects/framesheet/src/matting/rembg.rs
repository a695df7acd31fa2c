// rembg-backed matting. Each session owns one `rembg s` server process, so
// the model is loaded once and every frame is a local HTTP round trip.

use super::{MatteSettings, Matter, MattingProvider};
use anyhow::{anyhow, bail, Context, Result};
use image::{ImageFormat, RgbaImage};
use std::io::Cursor;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Model download plus load on a cold cache.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(120);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_RESPONSE_BYTES: u64 = 64 * 1024 * 1024;
const BOUNDARY: &str = "----framesheet-frame";

/// Spawns rembg sessions bound to one model.
#[derive(Debug, Clone)]
pub struct RembgProvider {
    bin: String,
    model: String,
    startup_timeout: Duration,
}

impl RembgProvider {
    pub fn new(bin: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            bin: bin.into(),
            model: model.into(),
            startup_timeout: STARTUP_TIMEOUT,
        }
    }
}

fn free_port() -> Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .context("Failed to reserve a port for rembg")?;
    Ok(listener.local_addr()?.port())
}

impl MattingProvider for RembgProvider {
    fn create_session(&self) -> Result<Box<dyn Matter>> {
        let port = free_port()?;
        let mut child = Command::new(&self.bin)
            .args(["s", "--host", "127.0.0.1", "--port", &port.to_string()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to launch matting tool '{}'", self.bin))?;

        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let deadline = Instant::now() + self.startup_timeout;
        loop {
            if let Some(status) = child.try_wait()? {
                bail!("rembg server exited before ready ({})", status);
            }
            if TcpStream::connect_timeout(&addr, Duration::from_millis(200)).is_ok() {
                break;
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                bail!(
                    "rembg server not ready on {} after {}s",
                    addr,
                    self.startup_timeout.as_secs()
                );
            }
            thread::sleep(Duration::from_millis(100));
        }

        tracing::info!(
            "rembg server for model '{}' listening on {} (pid {})",
            self.model,
            addr,
            child.id()
        );
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(REQUEST_TIMEOUT))
            .build()
            .into();
        Ok(Box::new(RembgSession {
            child,
            url: format!("http://{}/api/remove", addr),
            model: self.model.clone(),
            agent,
        }))
    }
}

pub struct RembgSession {
    child: Child,
    url: String,
    model: String,
    agent: ureq::Agent,
}

/// Form fields sent next to the frame.
fn form_fields(model: &str, settings: &MatteSettings) -> Vec<(&'static str, String)> {
    let mut fields = vec![("model", model.to_string())];
    if settings.alpha_matting {
        fields.extend([
            ("a", "true".to_string()),
            ("af", settings.foreground_threshold.to_string()),
            ("ab", settings.background_threshold.to_string()),
        ]);
    }
    fields
}

fn multipart_body(png: &[u8], fields: &[(&str, String)]) -> Vec<u8> {
    let mut body = Vec::with_capacity(png.len() + 512);
    for (name, value) in fields {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name).as_bytes(),
        );
        body.extend_from_slice(value.as_bytes());
        body.extend_from_slice(b"\r\n");
    }

    body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
    body.extend_from_slice(
        b"Content-Disposition: form-data; name=\"file\"; filename=\"frame.png\"\r\n",
    );
    body.extend_from_slice(b"Content-Type: image/png\r\n\r\n");
    body.extend_from_slice(png);
    body.extend_from_slice(b"\r\n");
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    body
}

impl Matter for RembgSession {
    fn matte(&mut self, frame: &RgbaImage, settings: &MatteSettings) -> Result<RgbaImage> {
        let mut png = Vec::new();
        frame
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .context("Failed to encode frame for matting")?;
        let body = multipart_body(&png, &form_fields(&self.model, settings));

        let response = self
            .agent
            .post(&self.url)
            .header(
                "Content-Type",
                &format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .send(&body[..])
            .map_err(|e| anyhow!("rembg request failed: {}", e))?;
        let bytes = response
            .into_body()
            .with_config()
            .limit(MAX_RESPONSE_BYTES)
            .read_to_vec()
            .context("Failed to read rembg response")?;

        let matted = image::load_from_memory_with_format(&bytes, ImageFormat::Png)
            .context("rembg returned an unreadable image")?;
        Ok(matted.to_rgba8())
    }
}

impl Drop for RembgSession {
    fn drop(&mut self) {
        if let Err(e) = self.child.kill() {
            tracing::debug!("rembg server {} already gone: {}", self.child.id(), e);
        }
        let _ = self.child.wait();
    }
}
