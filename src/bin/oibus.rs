use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "8934";
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(70);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("oibus")
        .version("0.1.0")
        .about("Command-line client for the oibus Roomba bridge")
        .global_setting(AppSettings::AllowNegativeNumbers)
        .arg(
            Arg::with_name("host")
                .short("H")
                .long("host")
                .value_name("HOST")
                .help("Bridge host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Bridge port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table", "compact"])
                .default_value("table")
                .global(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Enable verbose output")
                .global(true),
        )
        .subcommand(SubCommand::with_name("status").about("Show link state and dispatch statistics"))
        .subcommand(
            SubCommand::with_name("mode")
                .about("Switch the robot's OI mode")
                .arg(
                    Arg::with_name("mode")
                        .required(true)
                        .possible_values(&["off", "passive", "safe", "full"]),
                ),
        )
        .subcommand(
            SubCommand::with_name("drive")
                .about("Drive at a velocity (mm/s) along a radius (mm, 0 = straight)")
                .arg(Arg::with_name("velocity").required(true))
                .arg(Arg::with_name("radius").required(true))
                .arg(
                    Arg::with_name("for")
                        .long("for")
                        .value_name("MS")
                        .help("Stop again after this many milliseconds")
                        .takes_value(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("direct")
                .about("Set each wheel's velocity in mm/s")
                .arg(Arg::with_name("left").required(true))
                .arg(Arg::with_name("right").required(true)),
        )
        .subcommand(SubCommand::with_name("stop").about("Stop both wheels"))
        .subcommand(
            SubCommand::with_name("sing")
                .about("Store a song and play it")
                .arg(Arg::with_name("number").required(true).help("Song slot 0-4"))
                .arg(Arg::with_name("notes").required(true).help("Comma-separated MIDI notes"))
                .arg(Arg::with_name("durations").required(true).help("Comma-separated durations in 1/64 s")),
        )
        .subcommand(
            SubCommand::with_name("play")
                .about("Play a stored song")
                .arg(Arg::with_name("number").required(true)),
        )
        .subcommand(SubCommand::with_name("clean").about("Start a normal cleaning cycle"))
        .subcommand(SubCommand::with_name("spot").about("Start a spot cleaning cycle"))
        .subcommand(SubCommand::with_name("dock").about("Seek the charging dock"))
        .subcommand(
            SubCommand::with_name("sensor")
                .about("Read one sensor packet or group now")
                .arg(Arg::with_name("packet").required(true)),
        )
        .subcommand(
            SubCommand::with_name("monitor")
                .about("Stream live telemetry for one or more packets")
                .arg(Arg::with_name("packets").multiple(true).default_value("3")),
        )
        .subcommand(SubCommand::with_name("reconnect").about("Reopen the serial link"))
        .get_matches();

    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse::<u16>()?;
    let format = matches.value_of("format").unwrap_or("table");
    let verbose = matches.is_present("verbose");

    if verbose {
        println!("{}", "oibus - Roomba bridge client".bright_blue().bold());
        println!("{} {}:{}", "Connecting to".dimmed(), host, port);
    }

    let action = match matches.subcommand() {
        ("status", _) => serde_json::json!("Status"),
        ("mode", Some(sub)) => {
            let mode = match sub.value_of("mode").unwrap_or("passive") {
                "off" => "Off",
                "safe" => "Safe",
                "full" => "Full",
                _ => "Passive",
            };
            serde_json::json!({ "SetMode": { "mode": mode } })
        }
        ("drive", Some(sub)) => drive_action(sub)?,
        ("direct", Some(sub)) => serde_json::json!({
            "DriveDirect": { "left": number::<i16>(sub, "left")?, "right": number::<i16>(sub, "right")? }
        }),
        ("stop", _) => serde_json::json!("Stop"),
        ("sing", Some(sub)) => serde_json::json!({
            "Sing": {
                "number": number::<u8>(sub, "number")?,
                "notes": list(sub, "notes")?,
                "durations": list(sub, "durations")?,
            }
        }),
        ("play", Some(sub)) => serde_json::json!({ "PlaySong": { "number": number::<u8>(sub, "number")? } }),
        ("clean", _) => serde_json::json!("Clean"),
        ("spot", _) => serde_json::json!("Spot"),
        ("dock", _) => serde_json::json!("SeekDock"),
        ("sensor", Some(sub)) => serde_json::json!({ "ReadSensor": { "packet": number::<u8>(sub, "packet")? } }),
        ("reconnect", _) => serde_json::json!("Reconnect"),
        ("monitor", Some(sub)) => {
            let packets: Vec<u8> = sub
                .values_of("packets")
                .map(|values| values.filter_map(|v| v.parse().ok()).collect())
                .unwrap_or_default();
            return monitor(host, port, &packets, format).await;
        }
        _ => {
            println!("{}", "No command specified. Use --help for usage information.".yellow());
            println!("{}", "Quick start:".bright_green());
            println!("  {} Start the bridge against the simulator", "oibus-bridge --board sim".bright_cyan());
            println!("  {} Take control", "oibus mode safe".bright_cyan());
            println!("  {} Drive forward for a second", "oibus drive 200 0 --for 1000".bright_cyan());
            return Ok(());
        }
    };

    let (mut reader, mut writer) = connect(host, port).await?;
    let id = current_timestamp() as u32;
    let request = serde_json::json!({ "id": id, "action": action });
    let response = send_request(&mut reader, &mut writer, &request, id).await?;
    print_response(matches.subcommand_name().unwrap_or("request"), &response, format);

    Ok(())
}

fn number<T: std::str::FromStr>(matches: &ArgMatches<'_>, name: &str) -> Result<T, String> {
    let raw = matches.value_of(name).unwrap_or_default();
    raw.parse::<T>().map_err(|_| format!("{name}: '{raw}' is not a valid number"))
}

fn list(matches: &ArgMatches<'_>, name: &str) -> Result<Vec<u8>, String> {
    matches
        .value_of(name)
        .unwrap_or_default()
        .split(',')
        .map(|v| {
            v.trim()
                .parse::<u8>()
                .map_err(|_| format!("{name}: '{v}' is not a value between 0 and 255"))
        })
        .collect()
}

fn drive_action(sub: &ArgMatches<'_>) -> Result<serde_json::Value, String> {
    let velocity = number::<i16>(sub, "velocity")?;
    let radius = number::<i16>(sub, "radius")?;
    Ok(match sub.value_of("for") {
        Some(_) => serde_json::json!({
            "DriveFor": { "velocity": velocity, "radius": radius, "duration_ms": number::<u64>(sub, "for")? }
        }),
        None => serde_json::json!({ "Drive": { "velocity": velocity, "radius": radius } }),
    })
}

async fn connect(host: &str, port: u16) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", host, port);
    match TcpStream::connect(&addr).await {
        Ok(stream) => {
            let (reader, writer) = stream.into_split();
            Ok((BufReader::new(reader), writer))
        }
        Err(e) => {
            eprintln!("{} Failed to connect to bridge at {}", "❌".red(), addr.bright_white());
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                eprintln!("{} Bridge is not running. Start it with:", "💡".yellow());
                eprintln!("   {}", "oibus-bridge --board sim".bright_cyan());
            }
            Err(e.into())
        }
    }
}

// Telemetry lines may arrive before the response; skip until our id shows up
async fn send_request(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    request: &serde_json::Value,
    id: u32,
) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
    writer.write_all(request.to_string().as_bytes()).await?;
    writer.write_all(b"\n").await?;

    match tokio::time::timeout(RESPONSE_TIMEOUT, read_response(reader, id)).await {
        Ok(result) => result,
        Err(_) => {
            eprintln!("{} No response within {} s", "⏰".yellow(), RESPONSE_TIMEOUT.as_secs());
            Err("request timeout".into())
        }
    }
}

async fn read_response(
    reader: &mut BufReader<OwnedReadHalf>,
    id: u32,
) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Err("bridge closed the connection".into());
        }
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&line) {
            if value.get("telemetry").is_none() && (value["id"] == id || value["id"] == 0) {
                return Ok(value);
            }
        }
    }
}

fn print_response(action: &str, response: &serde_json::Value, format: &str) {
    match format {
        "json" => println!("{}", response),
        "compact" => {
            let status = response["status"].as_str().unwrap_or("Unknown");
            if status == "Success" {
                println!("{}", "OK".bright_green());
            } else {
                println!("{} {}", status.bright_red(), response["error"]["message"].as_str().unwrap_or(""));
            }
        }
        _ => {
            let status = response["status"].as_str().unwrap_or("Unknown");
            let message = response["error"]["message"].as_str().unwrap_or("");
            match status {
                "Success" => {
                    println!("{} {} {}", "✅".green(), action.bright_white(), "done".bright_green());
                    print_result(&response["result"]);
                }
                "NegativeAck" => {
                    println!("{} {} rejected: {}", "❌".red(), action.bright_white(), message.bright_red());
                    if response["error"]["kind"] == "IllegalInMode" {
                        println!("{} Try: {}", "💡".yellow(), "oibus mode safe".bright_cyan());
                    }
                }
                "ConnectionLost" => {
                    println!("{} {} failed: {}", "🔌".yellow(), action.bright_white(), message.bright_red());
                    println!("{} Try: {}", "💡".yellow(), "oibus reconnect".bright_cyan());
                }
                _ => {
                    println!("{} {} {}: {}", "⚠️".yellow(), action.bright_white(), status.bright_red(), message);
                }
            }
        }
    }
}

fn print_result(result: &serde_json::Value) {
    if let Some(status) = result.get("Status") {
        println!("{} {}", "Link:".bright_white(), status["link"].to_string().bright_cyan());
        println!("{} {}", "Connection:".bright_white(), status["connection"].to_string().bright_cyan());
        let dispatch = &status["dispatch"];
        println!(
            "{} sent {} | rejected {} | failed {} | retries {}",
            "Commands:".bright_white(),
            dispatch["commands_sent"],
            dispatch["commands_rejected"],
            dispatch["commands_failed"],
            dispatch["retries"]
        );
        println!("{} {}", "Polling:".bright_white(), status["polled"]);
    } else if let Some(sensor) = result.get("Sensor") {
        print_readings(&sensor["readings"]);
    } else if let Some(sent) = result.get("Sent") {
        println!("{} {}", "Frame:".dimmed(), sent["frame"].to_string().dimmed());
    }
}

fn print_readings(readings: &serde_json::Value) {
    if let Some(fields) = readings.as_object() {
        for (name, value) in fields {
            if !value.is_null() {
                println!("  {:<32} {}", name.bright_white(), value);
            }
        }
    }
}

async fn monitor(host: &str, port: u16, packets: &[u8], format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let (mut reader, mut writer) = connect(host, port).await?;
    for (i, packet) in packets.iter().enumerate() {
        let id = i as u32 + 1;
        let request = serde_json::json!({ "id": id, "action": { "Subscribe": { "packet": packet } } });
        let response = send_request(&mut reader, &mut writer, &request, id).await?;
        if response["status"] != "Success" {
            print_response("subscribe", &response, format);
            return Ok(());
        }
    }

    if format == "table" {
        println!("{}", "┌──────────────┬────────┬──────────────────────────────────────────┐".bright_white());
        println!("{}", "│ Time         │ Packet │ Values                                   │".bright_blue().bold());
        println!("{}", "├──────────────┼────────┼──────────────────────────────────────────┤".bright_white());
    }

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let Ok(value) = serde_json::from_str::<serde_json::Value>(&line) else {
            continue;
        };
        let Some(update) = value.get("telemetry") else {
            continue;
        };
        let packet = update["packet"]["packet"].as_u64().unwrap_or(0);
        if !packets.iter().any(|p| u64::from(*p) == packet) {
            continue;
        }

        match format {
            "json" => println!("{}", update),
            _ => {
                let time = update["received_at_ms"].as_u64().unwrap_or(0);
                let values: Vec<String> = update["packet"]["readings"]
                    .as_object()
                    .map(|fields| {
                        fields
                            .iter()
                            .filter(|(_, v)| !v.is_null())
                            .map(|(k, v)| format!("{}={}", k, v))
                            .collect()
                    })
                    .unwrap_or_default();
                if format == "compact" {
                    println!("[{}] #{} {}", time / 1000, packet, values.join(" "));
                } else {
                    println!("│ {:>12} │ {:>6} │ {}", time / 1000, packet.to_string().bright_cyan(), values.join(" "));
                }
            }
        }
    }

    Ok(())
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}
