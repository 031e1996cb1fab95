/// Binlog 덤프 도구
///
/// 인자로 파일을 주면 로컬 binlog 파일을 읽고 (`-` 는 stdin), 없으면 `DB_*` 환경변수의
/// 서버에 복제 슬레이브로 붙어서 스트리밍합니다. 이벤트마다 JSON 한 줄을 출력합니다.
/// 덤프 옵션은 `BINLOG_*` 환경변수로 받습니다 (`DumpOptions::from_env` 참고).
use rust_mysql_binlog::binlog::FileParser;
use rust_mysql_binlog::binlog_client::{BinlogSyncer, SyncerConfig};
use rust_mysql_binlog::config::{ConnectionConfig, DumpOptions};
use rust_mysql_binlog::error::{BinlogError, Result};
use rust_mysql_binlog::events::{BinlogEvent, EventType};
use rust_mysql_binlog::gtid::GtidSet;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn print_event<W: Write>(out: &mut W, event: &BinlogEvent) -> Result<()> {
    if event.is_skipped() {
        return Ok(());
    }
    serde_json::to_writer(&mut *out, event)?;
    out.write_all(b"\n")?;
    Ok(())
}

fn dump_files(options: &DumpOptions) -> Result<()> {
    let mut parser = FileParser::new(options.parse_options()?, options.time_filter()?)?;
    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    let mut on_event = |event: &BinlogEvent| print_event(&mut out, event);

    match options.files.as_slice() {
        [single] if single.as_os_str() == "-" => {
            parser.parse_reader(io::stdin().lock(), 0, &mut on_event)?;
        }
        [first] => parser.parse_files(first, options.stop_file.as_deref(), &mut on_event)?,
        files => {
            for file in files {
                parser.parse_file(file, 0, &mut on_event)?;
            }
        }
    }
    out.flush()?;
    Ok(())
}

async fn dump_server(options: &DumpOptions) -> Result<()> {
    let connection = ConnectionConfig::from_env()?;
    info!("Connecting to {}", connection.address());
    let mut config = SyncerConfig::new(options.server_id, connection);
    config.flavor = options.flavor;
    config.semi_sync = options.semi_sync;
    config.non_blocking = options.non_blocking;
    config.parse_options = options.parse_options()?;

    let filter = options.time_filter()?;
    let mut syncer = BinlogSyncer::new(config);
    let mut streamer = match &options.gtid {
        Some(gtid) => syncer.start_sync_gtid(GtidSet::parse(options.flavor, gtid)?).await?,
        None => syncer.start_sync(options.start()?).await?,
    };

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    let result = loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => break Ok(()),
            event = streamer.next() => event,
        };
        let event = match event {
            Ok(event) => event,
            Err(BinlogError::SyncClosed(reason)) if options.non_blocking => {
                info!("Stream ended: {}", reason);
                break Ok(());
            }
            Err(e) => break Err(e),
        };
        if filter.stop_ts.is_some_and(|stop| event.header.timestamp > stop) {
            break Ok(());
        }
        if let Err(e) = print_event(&mut out, &event) {
            break Err(e);
        }
        if event.header.event_type == EventType::Xid {
            out.flush()?;
        }
        let stop_reached = options.stop_position.is_some_and(|stop| {
            u64::from(event.header.log_pos) >= stop
                && options.stop_file.as_deref().map_or(true, |f| f == syncer.position().filename)
        });
        if stop_reached {
            break Ok(());
        }
    };
    out.flush()?;
    info!("Stopped at {}", syncer.position());
    syncer.close();
    result
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let mut options = match DumpOptions::from_env() {
        Ok(options) => options,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    options.files = std::env::args().skip(1).map(PathBuf::from).collect();

    let result = if options.files.is_empty() {
        dump_server(&options).await
    } else {
        dump_files(&options)
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
