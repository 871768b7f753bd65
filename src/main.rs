use std::io::Write;

use bytes::Bytes;
use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::runtime::Builder;

use authgate::config;
use authgate::handshake::HandshakeSettings;
use authgate::{ConnectionEvent, ShimConnector, StageChain, Target, channel_endpoint};

fn print_usage_and_exit(arg0: String) {
    eprintln!("Usage: {arg0} [--dry-run/-d] <config filename> <host:port>");
    std::process::exit(1);
}

fn describe(settings: &HandshakeSettings, target: &Target) -> String {
    if !target.matches_host_suffix(&settings.host_suffixes) {
        return format!("{target}: passthrough, no handshake");
    }
    let tls = if target.is_tls_port(&settings.ssl_ports) {
        "TLS, "
    } else {
        ""
    };
    let heartbeat = if settings.keepalive_interval.is_zero() {
        "no heartbeat".to_string()
    } else {
        format!("heartbeat every {:?}", settings.keepalive_interval)
    };
    format!(
        "{target}: {tls}authenticate as cluster {}, {heartbeat}",
        settings.cluster_name
    )
}

async fn run(settings: HandshakeSettings, target: Target) -> std::io::Result<()> {
    let connector = ShimConnector::new(settings);
    let (endpoint, mut events) = channel_endpoint();
    let connection = connector
        .connect(target, StageChain::new().with("stdio", endpoint))
        .await?;

    let stdin_connection = connection.clone();
    tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = vec![0u8; 16384];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(e) = stdin_connection.write(Bytes::copy_from_slice(&buf[..n])) {
                        eprintln!("Write failed: {e}");
                        break;
                    }
                }
                Err(e) => {
                    eprintln!("Failed to read stdin: {e}");
                    break;
                }
            }
        }
    });

    let mut stdout = tokio::io::stdout();
    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::Connected(target) => debug!("Connected to {target}"),
            ConnectionEvent::Data(data) => {
                stdout.write_all(&data).await?;
                stdout.flush().await?;
            }
            ConnectionEvent::Error(e) => return Err(e),
            ConnectionEvent::Closed => break,
        }
    }

    Ok(())
}

fn main() {
    env_logger::builder()
        .format(|buf, record| {
            let timestamp = buf.timestamp();
            let level_style = buf.default_level_style(record.level());
            let sanitized_args = format!("{}", record.args())
                .chars()
                .map(|c| {
                    if c.is_ascii_graphic() || c == ' ' {
                        c
                    } else {
                        '?'
                    }
                })
                .collect::<String>();

            writeln!(
                buf,
                "[{} {level_style}{}{level_style:#} {}] {}",
                timestamp,
                record.level(),
                record.target(),
                sanitized_args
            )
        })
        .init();

    let mut args: Vec<String> = std::env::args().collect();
    let arg0 = args.remove(0);
    let mut dry_run = false;

    while !args.is_empty() && args[0].starts_with("-") {
        if args[0] == "--dry-run" || args[0] == "-d" {
            args.remove(0);
            dry_run = true;
        } else {
            eprintln!("Invalid argument: {}", args[0]);
            print_usage_and_exit(arg0);
            return;
        }
    }

    if args.len() != 2 {
        print_usage_and_exit(arg0);
        return;
    }

    let target = match Target::parse(&args[1], None) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("Invalid target {}: {e}\n", args[1]);
            print_usage_and_exit(arg0);
            return;
        }
    };

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()
        .expect("Could not build tokio runtime");

    let config_filename = args.remove(0);
    let result = runtime.block_on(async move {
        let config = match config::load_config(&config_filename).await {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config: {e}\n");
                print_usage_and_exit(arg0);
                return Ok(());
            }
        };
        debug!("{config:#?}");

        let settings = match config::create_handshake_settings(config) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("Invalid config: {e}\n");
                print_usage_and_exit(arg0);
                return Ok(());
            }
        };

        if dry_run {
            println!("{}", describe(&settings, &target));
            println!("Finishing dry run, config parsed successfully.");
            return Ok(());
        }

        run(settings, target).await
    });

    if let Err(e) = result {
        eprintln!("Connection failed: {e}");
        std::process::exit(1);
    }
}
