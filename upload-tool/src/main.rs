use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::blocking::{multipart, Body, Client, RequestBuilder};
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "fw-upload")]
#[command(about = "Upload firmware or filesystem images to an ESP32 uploader", long_about = None)]
struct Cli {
    /// Device IP address or hostname
    host: String,

    #[command(subcommand)]
    command: Option<Commands>,

    /// Image to upload
    #[arg(short, long, default_value = "target/xtensa-esp32s3-espidf/release/firmware.bin")]
    image: PathBuf,

    /// Which region to update
    #[arg(short, long, value_enum, default_value_t = Mode::Firmware)]
    mode: Mode,

    /// Port number
    #[arg(short, long, default_value = "80")]
    port: u16,

    /// Basic auth username
    #[arg(short, long, requires = "password")]
    user: Option<String>,

    /// Basic auth password
    #[arg(long, requires = "user")]
    password: Option<String>,

    /// Send the image as a raw body instead of a multipart form
    #[arg(long)]
    raw: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the device's upload status
    Status,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    Firmware,
    Filesystem,
}

impl Mode {
    fn as_str(self) -> &'static str {
        match self {
            Mode::Firmware => "firmware",
            Mode::Filesystem => "filesystem",
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Status) => show_status(&cli),
        None => upload(&cli),
    };

    if let Err(message) = result {
        eprintln!("{} {}", "❌".red(), message);
        process::exit(1);
    }
}

fn base_url(host: &str, port: u16) -> String {
    format!("http://{}:{}", host, port)
}

fn upload_url(host: &str, port: u16, mode: Mode, size: usize) -> String {
    format!("{}/ota/upload?mode={}&size={}", base_url(host, port), mode.as_str(), size)
}

/// The device answers 200 for both outcomes; only an exact "OK" is success.
fn upload_succeeded(status: u16, body: &str) -> bool {
    status == 200 && body == "OK"
}

fn with_auth(request: RequestBuilder, cli: &Cli) -> RequestBuilder {
    match (&cli.user, &cli.password) {
        (Some(user), Some(password)) => request.basic_auth(user, Some(password)),
        _ => request,
    }
}

fn client(timeout: Duration) -> Result<Client, String> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| format!("Failed to create HTTP client: {}", e))
}

fn show_status(cli: &Cli) -> Result<(), String> {
    let url = format!("{}/ota/status", base_url(&cli.host, cli.port));
    let response = with_auth(client(Duration::from_secs(5))?.get(&url), cli)
        .send()
        .map_err(|e| format!("Device not reachable: {}", e))?;

    if response.status().as_u16() == 401 {
        return Err("Authentication required (use --user/--password)".to_string());
    }

    let json: serde_json::Value = response
        .json()
        .map_err(|e| format!("Unexpected status response: {}", e))?;
    println!(
        "{}",
        serde_json::to_string_pretty(&json).map_err(|e| e.to_string())?
    );
    Ok(())
}

fn upload(cli: &Cli) -> Result<(), String> {
    if !cli.image.exists() {
        return Err(format!("Image not found: {}", cli.image.display()));
    }
    let image = fs::read(&cli.image).map_err(|e| format!("Failed to read image: {}", e))?;
    let file_size = image.len();
    let file_name = file_name(&cli.image);

    println!("{} ESP32 {} update", "🚀".blue(), cli.mode.as_str());
    println!("{}Device: {}:{}", "   ".dimmed(), cli.host, cli.port);
    println!(
        "{}Image: {} ({} bytes, {:.2} MB)",
        "   ".dimmed(),
        file_name,
        file_size,
        file_size as f64 / 1024.0 / 1024.0
    );

    let pb = ProgressBar::new(file_size as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes}")
            .map_err(|e| e.to_string())?
            .progress_chars("#>-"),
    );

    let reader = pb.wrap_read(Cursor::new(image));
    let url = upload_url(&cli.host, cli.port, cli.mode, file_size);
    let client = client(Duration::from_secs(300))?;

    let request = if cli.raw {
        client
            .post(&url)
            .header("Content-Type", "application/octet-stream")
            .body(Body::sized(reader, file_size as u64))
    } else {
        let part = multipart::Part::reader_with_length(reader, file_size as u64)
            .file_name(file_name)
            .mime_str("application/octet-stream")
            .map_err(|e| e.to_string())?;
        client
            .post(&url)
            .multipart(multipart::Form::new().part("update", part))
    };

    let response = with_auth(request, cli).send();
    pb.finish_and_clear();
    let response = response.map_err(|e| format!("Error: {}", e))?;

    let status = response.status().as_u16();
    if status == 401 {
        return Err("Authentication failed".to_string());
    }
    let body = response.text().map_err(|e| format!("Failed to read response: {}", e))?;

    if upload_succeeded(status, &body) {
        println!("{} Upload successful! Device will restart if auto reboot is on.", "✅".green());
        Ok(())
    } else {
        Err(format!(
            "Update failed: HTTP {} {:?} (run `fw-upload {} status` for details)",
            status, body, cli.host
        ))
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("image.bin")
        .to_string()
}
