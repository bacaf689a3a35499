// SFU Rooms CLI Validation Tool
// Talks to a running server over HTTP and the signaling WebSocket

use clap::{Parser, Subcommand};
use colored::*;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::collections::{BTreeMap, HashSet};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Duration, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use sfu_rooms::client::ClientReconciler;
use sfu_rooms::media::types::{
    DtlsFingerprint, DtlsParameters, DtlsRole, RtpCodecParameters, RtpEncodingParameters,
};
use sfu_rooms::media::{MediaKind, RtpCapabilities, RtpParameters, TransportDirection};
use sfu_rooms::sfu::{SfuEvent, SfuRequest};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Parser)]
#[command(name = "sfu-cli")]
#[command(about = "SFU Rooms CLI Validation Tool", long_about = None)]
struct Cli {
    /// Server address (default: 127.0.0.1:8080)
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check server health endpoint
    Health,

    /// Get server configuration
    Config,

    /// Test WebSocket connection
    Connect,

    /// Join a room and print the reconciled participant view
    Join {
        /// Room name
        #[arg(short, long)]
        room: String,

        /// Display name
        #[arg(short, long, default_value = "cli")]
        name: String,

        /// Publish a video producer after joining
        #[arg(short, long)]
        produce: bool,

        /// Consume every stream announced in the room
        #[arg(short, long)]
        consume: bool,

        /// Leave after this many seconds (default: until Ctrl+C)
        #[arg(short, long)]
        duration: Option<u64>,
    },

    /// Record a room for a number of seconds
    Record {
        /// Room name
        #[arg(short, long)]
        room: String,

        /// Display name
        #[arg(short, long, default_value = "cli-recorder")]
        name: String,

        /// Seconds to record
        #[arg(short, long, default_value_t = 5)]
        seconds: u64,
    },

    /// List retained recordings
    Recordings,

    /// Delete a recording
    DeleteRecording {
        /// Recording ID
        id: String,
    },

    /// Run automated validation scenarios
    Validate,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Health => check_health(&cli.server).await,
        Commands::Config => check_config(&cli.server).await,
        Commands::Connect => test_connection(&cli.server).await,
        Commands::Join {
            room,
            name,
            produce,
            consume,
            duration,
        } => {
            join_room(&cli.server, room, name, *produce, *consume, *duration).await;
        }
        Commands::Record {
            room,
            name,
            seconds,
        } => record_room(&cli.server, room, name, *seconds).await,
        Commands::Recordings => list_recordings(&cli.server).await,
        Commands::DeleteRecording { id } => delete_recording(&cli.server, id).await,
        Commands::Validate => run_validation(&cli.server).await,
    }
}

/// Signaling connection with typed send/receive.
struct SignalingClient {
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
}

impl SignalingClient {
    async fn connect(server: &str) -> Result<Self, String> {
        let url = format!("ws://{}/sfu", server);
        let (ws_stream, _) = connect_async(&url)
            .await
            .map_err(|e| format!("cannot connect to {}: {}", url, e))?;
        let (write, read) = ws_stream.split();
        Ok(Self { write, read })
    }

    async fn send(&mut self, request: &SfuRequest) -> Result<(), String> {
        let text = serde_json::to_string(request).map_err(|e| e.to_string())?;
        self.write
            .send(Message::Text(text))
            .await
            .map_err(|e| format!("send failed: {}", e))
    }

    /// Next signaling event, or `None` on timeout or close.
    async fn next_event(&mut self, wait: Duration) -> Option<SfuEvent> {
        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.checked_duration_since(Instant::now())?;
            match timeout(remaining, self.read.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str(&text) {
                    Ok(event) => return Some(event),
                    Err(e) => println!("{} Unparseable event: {} ({})", "✗".yellow(), text, e),
                },
                Ok(Some(Ok(Message::Close(_)))) | Ok(None) => return None,
                Ok(Some(Ok(_))) => continue,
                Ok(Some(Err(e))) => {
                    println!("{} Connection error: {}", "✗".red(), e);
                    return None;
                }
                Err(_) => return None,
            }
        }
    }

    /// Waits for the first event matching `pred`, feeding everything seen to
    /// the reconciler. An `error` event ends the wait.
    async fn wait_for_event<F>(
        &mut self,
        reconciler: &mut ClientReconciler,
        wait: Duration,
        mut pred: F,
    ) -> Result<SfuEvent, String>
    where
        F: FnMut(&SfuEvent) -> bool,
    {
        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or_else(|| "timed out waiting for server".to_string())?;
            let event = self
                .next_event(remaining)
                .await
                .ok_or_else(|| "connection closed or timed out".to_string())?;
            reconciler.apply_event(&event);
            if let SfuEvent::Error { message, code } = &event {
                return Err(format!("{} ({})", message, code.as_str()));
            }
            if pred(&event) {
                return Ok(event);
            }
        }
    }

    async fn join(
        &mut self,
        reconciler: &mut ClientReconciler,
        room: &str,
        name: &str,
    ) -> Result<RtpCapabilities, String> {
        self.send(&SfuRequest::Join {
            room_name: room.to_string(),
            peer_name: name.to_string(),
        })
        .await?;
        match self
            .wait_for_event(reconciler, Duration::from_secs(5), |e| {
                matches!(e, SfuEvent::Joined { .. })
            })
            .await?
        {
            SfuEvent::Joined {
                router_rtp_capabilities,
                ..
            } => Ok(router_rtp_capabilities),
            _ => Err("unexpected response to join".to_string()),
        }
    }

    async fn open_transport(
        &mut self,
        reconciler: &mut ClientReconciler,
        direction: TransportDirection,
    ) -> Result<String, String> {
        self.send(&SfuRequest::CreateTransport { direction }).await?;
        let transport_id = match self
            .wait_for_event(reconciler, Duration::from_secs(5), |e| {
                matches!(e, SfuEvent::TransportCreated { direction: d, .. } if *d == direction)
            })
            .await?
        {
            SfuEvent::TransportCreated { transport_id, .. } => transport_id,
            _ => return Err("unexpected response to createTransport".to_string()),
        };

        self.send(&SfuRequest::ConnectTransport {
            transport_id: transport_id.clone(),
            dtls_parameters: client_dtls(),
        })
        .await?;
        self.wait_for_event(reconciler, Duration::from_secs(5), |e| {
            matches!(e, SfuEvent::TransportConnected { .. })
        })
        .await?;
        Ok(transport_id)
    }

    async fn produce_video(
        &mut self,
        reconciler: &mut ClientReconciler,
        transport_id: &str,
    ) -> Result<String, String> {
        self.send(&SfuRequest::Produce {
            transport_id: transport_id.to_string(),
            kind: MediaKind::Video,
            rtp_parameters: vp8_parameters(),
        })
        .await?;
        match self
            .wait_for_event(reconciler, Duration::from_secs(5), |e| {
                matches!(e, SfuEvent::Produced { .. })
            })
            .await?
        {
            SfuEvent::Produced { producer_id, .. } => Ok(producer_id),
            _ => Err("unexpected response to produce".to_string()),
        }
    }

    async fn consume(
        &mut self,
        reconciler: &mut ClientReconciler,
        producer_id: &str,
        capabilities: &RtpCapabilities,
    ) -> Result<String, String> {
        self.send(&SfuRequest::Consume {
            producer_id: producer_id.to_string(),
            rtp_capabilities: capabilities.clone(),
        })
        .await?;
        let consumer_id = match self
            .wait_for_event(reconciler, Duration::from_secs(5), |e| {
                matches!(e, SfuEvent::Consumed { producer_id: p, .. } if p == producer_id)
            })
            .await?
        {
            SfuEvent::Consumed { consumer_id, .. } => consumer_id,
            _ => return Err("unexpected response to consume".to_string()),
        };

        self.send(&SfuRequest::ResumeConsumer {
            consumer_id: consumer_id.clone(),
        })
        .await?;
        self.wait_for_event(reconciler, Duration::from_secs(5), |e| {
            matches!(e, SfuEvent::ConsumerResumed { consumer_id: c } if *c == consumer_id)
        })
        .await?;
        Ok(consumer_id)
    }
}

fn client_dtls() -> DtlsParameters {
    DtlsParameters {
        role: DtlsRole::Client,
        fingerprints: vec![DtlsFingerprint {
            algorithm: "sha-256".to_string(),
            value: hex::encode_upper(rand::random::<[u8; 32]>())
                .as_bytes()
                .chunks(2)
                .map(|pair| String::from_utf8_lossy(pair).into_owned())
                .collect::<Vec<_>>()
                .join(":"),
        }],
    }
}

fn vp8_parameters() -> RtpParameters {
    RtpParameters {
        mid: Some("0".to_string()),
        codecs: vec![RtpCodecParameters {
            mime_type: "video/VP8".to_string(),
            payload_type: 96,
            clock_rate: 90000,
            channels: None,
            parameters: BTreeMap::new(),
            rtcp_feedback: vec![],
        }],
        encodings: vec![RtpEncodingParameters {
            ssrc: Some(rand::random()),
        }],
    }
}

fn print_view(reconciler: &ClientReconciler) {
    println!("\n{}", "═".repeat(50).green());
    println!(
        "{} {}   {} {}",
        "Room:".bold(),
        reconciler.room_id().unwrap_or("-").green(),
        "Me:".bold(),
        reconciler.local_id().unwrap_or("-")
    );
    if let Some(recording) = reconciler.active_recording() {
        println!("{} {}", "● Recording".red().bold(), recording);
    }
    let participants = reconciler.participants();
    if participants.is_empty() {
        println!("  (no other participants)");
    }
    for participant in participants {
        println!("  {} {} ({})", "◆".cyan(), participant.peer_name.bold(), participant.peer_id);
        for stream in reconciler.streams_of(&participant.peer_id) {
            println!("      {} {} {}", "▸".green(), stream.kind, stream.producer_id);
        }
    }
    if reconciler.pending_count() > 0 {
        println!("  {} stream(s) waiting for their peer", reconciler.pending_count());
    }
    println!("{}", "═".repeat(50).green());
}

async fn check_health(server: &str) {
    println!("{}", "Checking server health...".cyan());

    let url = format!("http://{}/sfu/health", server);
    let client = reqwest::Client::new();

    match client.get(&url).send().await {
        Ok(resp) => {
            let status = resp.status();
            if status.is_success() {
                println!("{} Health check passed", "✓".green());

                if let Ok(body) = resp.json::<serde_json::Value>().await {
                    println!("  Status: {}", body["status"].as_str().unwrap_or("unknown"));
                    println!("  Service: {}", body["service"].as_str().unwrap_or("unknown"));
                    println!("  Version: {}", body["version"].as_str().unwrap_or("unknown"));
                    println!("  Rooms: {}", body["rooms"]);
                    println!("  Active recordings: {}", body["activeRecordings"]);
                }
            } else {
                println!("{} Health check failed: {}", "✗".red(), status);
            }
        }
        Err(e) => {
            println!("{} Cannot connect to server: {}", "✗".red(), e);
            println!("  Make sure the server is running on {}", server);
        }
    }
}

async fn check_config(server: &str) {
    println!("{}", "Fetching server configuration...".cyan());

    let url = format!("http://{}/sfu/config", server);
    let client = reqwest::Client::new();

    match client.get(&url).send().await {
        Ok(resp) => {
            if resp.status().is_success() {
                println!("{} Config endpoint accessible", "✓".green());

                if let Ok(body) = resp.json::<serde_json::Value>().await {
                    println!("\nConfiguration:");
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&body).unwrap_or_else(|_| body.to_string())
                    );
                }
            } else {
                println!("{} Config fetch failed: {}", "✗".red(), resp.status());
            }
        }
        Err(e) => {
            println!("{} Cannot connect to server: {}", "✗".red(), e);
        }
    }
}

async fn test_connection(server: &str) {
    println!("{}", "Testing WebSocket connection...".cyan());

    match SignalingClient::connect(server).await {
        Ok(client) => {
            println!("{} WebSocket connection established", "✓".green());
            drop(client);
            println!("{} Connection closed cleanly", "✓".green());
        }
        Err(e) => {
            println!("{} WebSocket connection failed: {}", "✗".red(), e);
        }
    }
}

async fn join_room(
    server: &str,
    room: &str,
    name: &str,
    produce: bool,
    consume: bool,
    duration: Option<u64>,
) {
    println!("{}", "Joining room...".cyan());
    println!("  Room: {}", room);
    println!("  Name: {}", name);

    let mut client = match SignalingClient::connect(server).await {
        Ok(client) => client,
        Err(e) => {
            println!("{} {}", "✗".red(), e);
            return;
        }
    };
    let mut reconciler = ClientReconciler::new();

    let capabilities = match client.join(&mut reconciler, room, name).await {
        Ok(capabilities) => capabilities,
        Err(e) => {
            println!("{} Join failed: {}", "✗".red(), e);
            return;
        }
    };
    println!("{} Joined", "✓".green());

    if produce {
        let produced = match client.open_transport(&mut reconciler, TransportDirection::Send).await {
            Ok(transport_id) => client.produce_video(&mut reconciler, &transport_id).await,
            Err(e) => Err(e),
        };
        match produced {
            Ok(producer_id) => println!("{} Producing video: {}", "✓".green(), producer_id),
            Err(e) => println!("{} Produce failed: {}", "✗".red(), e),
        }
    }

    let mut consumed: HashSet<String> = HashSet::new();
    if consume {
        if let Err(e) = client.open_transport(&mut reconciler, TransportDirection::Recv).await {
            println!("{} Receive transport failed: {}", "✗".red(), e);
        }
    }

    print_view(&reconciler);
    println!("Press {} to leave.", "Ctrl+C".bold());

    let deadline = duration.map(|secs| Instant::now() + Duration::from_secs(secs));
    loop {
        if deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
            break;
        }

        if consume {
            let wanted: Vec<String> = reconciler
                .streams()
                .iter()
                .map(|s| s.producer_id.clone())
                .filter(|p| !consumed.contains(p))
                .collect();
            for producer_id in wanted {
                consumed.insert(producer_id.clone());
                match client.consume(&mut reconciler, &producer_id, &capabilities).await {
                    Ok(consumer_id) => println!("{} Consuming {} as {}", "✓".green(), producer_id, consumer_id),
                    Err(e) => println!("{} Consume {} failed: {}", "✗".red(), producer_id, e),
                }
            }
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = client.next_event(Duration::from_secs(1)) => {
                let Some(event) = event else { continue };
                if let SfuEvent::Error { message, .. } = &event {
                    println!("{} {}", "✗".red(), message);
                }
                let closed = matches!(event, SfuEvent::RoomClosed { .. });
                if reconciler.apply_event(&event) {
                    print_view(&reconciler);
                }
                if closed {
                    println!("{} Room closed by server", "✗".yellow());
                    return;
                }
            }
        }
    }

    if client.send(&SfuRequest::Leave).await.is_ok() {
        let _ = client
            .wait_for_event(&mut reconciler, Duration::from_secs(2), |e| matches!(e, SfuEvent::Left { .. }))
            .await;
    }
    println!("{} Left room", "✓".green());
}

async fn record_room(server: &str, room: &str, name: &str, seconds: u64) {
    println!("{}", "Recording room...".cyan());

    let mut client = match SignalingClient::connect(server).await {
        Ok(client) => client,
        Err(e) => {
            println!("{} {}", "✗".red(), e);
            return;
        }
    };
    let mut reconciler = ClientReconciler::new();
    if let Err(e) = client.join(&mut reconciler, room, name).await {
        println!("{} Join failed: {}", "✗".red(), e);
        return;
    }
    print_view(&reconciler);

    if let Err(e) = client.send(&SfuRequest::StartRecording).await {
        println!("{} {}", "✗".red(), e);
        return;
    }
    let recording_id = match client
        .wait_for_event(&mut reconciler, Duration::from_secs(30), |e| {
            matches!(e, SfuEvent::RecordingStarted { .. })
        })
        .await
    {
        Ok(SfuEvent::RecordingStarted {
            recording_id,
            start_time,
        }) => {
            println!("{} Recording {} started at {}", "✓".green(), recording_id, start_time);
            recording_id
        }
        Ok(_) => return,
        Err(e) => {
            println!("{} Start failed: {}", "✗".red(), e);
            return;
        }
    };

    sleep(Duration::from_secs(seconds)).await;

    if let Err(e) = client
        .send(&SfuRequest::StopRecording {
            recording_id: recording_id.clone(),
        })
        .await
    {
        println!("{} {}", "✗".red(), e);
        return;
    }
    match client
        .wait_for_event(&mut reconciler, Duration::from_secs(10), |e| {
            matches!(e, SfuEvent::RecordingStopped { .. } | SfuEvent::RecordingFailed { .. })
        })
        .await
    {
        Ok(SfuEvent::RecordingStopped { file_path, .. }) => {
            println!("{} Recording stopped, writing {}", "✓".green(), file_path)
        }
        Ok(SfuEvent::RecordingFailed { reason, .. }) => {
            println!("{} Recording failed: {}", "✗".red(), reason);
            return;
        }
        Ok(_) => {}
        Err(e) => {
            println!("{} Stop failed: {}", "✗".red(), e);
            return;
        }
    }

    // Finalization happens after stop; poll the HTTP listing for the outcome.
    let http = reqwest::Client::new();
    let url = format!("http://{}/sfu/recordings", server);
    for _ in 0..30 {
        if let Ok(resp) = http.get(&url).send().await {
            if let Ok(body) = resp.json::<serde_json::Value>().await {
                let entry = body["recordings"]
                    .as_array()
                    .and_then(|list| list.iter().find(|r| r["id"] == recording_id.as_str()))
                    .cloned();
                if let Some(entry) = entry {
                    match entry["status"].as_str() {
                        Some("completed") => {
                            println!(
                                "{} Recording completed ({} bytes)",
                                "✓".green(),
                                entry["fileSize"]
                            );
                            return;
                        }
                        Some("failed") => {
                            println!("{} Recording failed: {}", "✗".red(), entry["failureReason"]);
                            return;
                        }
                        _ => {}
                    }
                }
            }
        }
        sleep(Duration::from_secs(1)).await;
    }
    println!("{} Recording still finalizing", "⚠".yellow());
}

async fn list_recordings(server: &str) {
    let url = format!("http://{}/sfu/recordings", server);
    match reqwest::get(&url).await {
        Ok(resp) => match resp.json::<serde_json::Value>().await {
            Ok(body) => {
                let list = body["recordings"].as_array().cloned().unwrap_or_default();
                if list.is_empty() {
                    println!("No recordings");
                }
                for recording in list {
                    println!(
                        "{}  {}  {}  {}",
                        recording["id"].as_str().unwrap_or("?").bold(),
                        recording["roomName"].as_str().unwrap_or("?"),
                        recording["status"].as_str().unwrap_or("?").cyan(),
                        recording["filePath"].as_str().unwrap_or("")
                    );
                }
            }
            Err(e) => println!("{} Invalid response: {}", "✗".red(), e),
        },
        Err(e) => println!("{} Cannot connect to server: {}", "✗".red(), e),
    }
}

async fn delete_recording(server: &str, id: &str) {
    let url = format!("http://{}/sfu/recordings/{}", server, id);
    match reqwest::Client::new().delete(&url).send().await {
        Ok(resp) if resp.status().is_success() => println!("{} Deleted {}", "✓".green(), id),
        Ok(resp) => {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            println!("{} Delete failed ({}): {}", "✗".red(), status, body);
        }
        Err(e) => println!("{} Cannot connect to server: {}", "✗".red(), e),
    }
}

/// Two peers exchange a video stream, then the publisher disconnects.
async fn run_validation(server: &str) {
    println!("{}", "Running two-peer validation...".cyan());
    match two_peer_scenario(server).await {
        Ok(()) => println!("\n{} All checks passed", "✓".green().bold()),
        Err(e) => println!("\n{} Validation failed: {}", "✗".red().bold(), e),
    }
}

async fn two_peer_scenario(server: &str) -> Result<(), String> {
    let room = format!("cli-validate-{}", rand::random::<u32>());

    let mut alice = SignalingClient::connect(server).await?;
    let mut alice_view = ClientReconciler::new();
    alice.join(&mut alice_view, &room, "alice").await?;
    let alice_id = alice_view.local_id().unwrap_or_default().to_string();
    step(alice_view.participants().is_empty(), "alice joins an empty room")?;

    let mut bob = SignalingClient::connect(server).await?;
    let mut bob_view = ClientReconciler::new();
    let capabilities = bob.join(&mut bob_view, &room, "bob").await?;
    step(
        bob_view.participant(&alice_id).is_some(),
        "bob sees alice in the existing-peer list",
    )?;

    alice
        .wait_for_event(&mut alice_view, Duration::from_secs(5), |e| {
            matches!(e, SfuEvent::PeerJoined { .. })
        })
        .await?;
    step(alice_view.participants().len() == 1, "alice receives peerJoined for bob")?;

    let send = alice.open_transport(&mut alice_view, TransportDirection::Send).await?;
    let producer_id = alice.produce_video(&mut alice_view, &send).await?;
    step(true, "alice produces video")?;

    bob.wait_for_event(&mut bob_view, Duration::from_secs(5), |e| {
        matches!(e, SfuEvent::NewProducer { producer_id: p, .. } if *p == producer_id)
    })
    .await?;
    step(bob_view.streams_of(&alice_id).len() == 1, "bob is told about alice's stream")?;

    bob.open_transport(&mut bob_view, TransportDirection::Recv).await?;
    bob.consume(&mut bob_view, &producer_id, &capabilities).await?;
    step(true, "bob consumes and resumes alice's stream")?;

    drop(alice);
    bob.wait_for_event(&mut bob_view, Duration::from_secs(5), |e| {
        matches!(e, SfuEvent::PeerLeft { peer_id } if *peer_id == alice_id)
    })
    .await?;
    step(
        bob_view.participants().is_empty() && bob_view.streams().is_empty(),
        "alice's disconnect removes her and her stream",
    )?;
    Ok(())
}

fn step(ok: bool, label: &str) -> Result<(), String> {
    if ok {
        println!("  {} {}", "✓".green(), label);
        Ok(())
    } else {
        println!("  {} {}", "✗".red(), label);
        Err(label.to_string())
    }
}
