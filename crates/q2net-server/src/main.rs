// q2ded -- dedicated server
//
// Usage: q2ded [+set name value]... [+map mapname]
// Lines typed on stdin run as operator commands.

use std::io::{self, BufRead};
use std::process::ExitCode;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver};
use thiserror::Error;

use q2net_common::cmd::CmdArgs;
use q2net_common::cmodel::BoxWorld;
use q2net_common::common::sys_milliseconds;
use q2net_common::cvar::CvarContext;
use q2net_common::net::UdpTransport;
use q2net_server::sv_init::sv_init_cvars;
use q2net_server::{
    sv_execute_command, sv_frame, sv_shutdown, sv_spawn_server, sv_time_to_next_frame, ServerContext, ServerState,
};

const DEFAULT_MAP: &str = "base1";

#[derive(Debug, Error)]
enum StartupError {
    #[error("couldn't open server socket on port {port}: {source}")]
    Bind { port: u16, source: io::Error },
    #[error("couldn't start network thread: {0}")]
    IoThread(io::Error),
}

/// Feed stdin lines to the server loop.
fn spawn_console() -> Receiver<String> {
    let (tx, rx) = unbounded();
    let spawned = std::thread::Builder::new().name("console".into()).spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    if let Err(e) = spawned {
        log::warn!("no console: {}", e);
    }
    rx
}

fn init(args: &[String]) -> Result<(ServerContext, Vec<String>), StartupError> {
    let mut cvars = CvarContext::new();
    let commands = cvars.parse_command_line(args);
    sv_init_cvars(&mut cvars);

    let port = cvars.variable_value("port") as u16;
    let mut transport = UdpTransport::bind(port).map_err(|source| StartupError::Bind { port, source })?;
    transport.start_io_thread().map_err(StartupError::IoThread)?;

    let ctx = ServerContext::new(Box::new(transport), Box::new(BoxWorld::with_floor(0.0)), cvars);
    Ok((ctx, commands))
}

/// Run one console line. Returns false when the server should exit.
fn console_command(ctx: &mut ServerContext, line: &str) -> bool {
    let args = CmdArgs::tokenize(line);
    if matches!(args.argv(0), "quit" | "exit") {
        return false;
    }
    print!("{}", sv_execute_command(ctx, &args));
    true
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (mut ctx, commands) = match init(&args) {
        Ok(v) => v,
        Err(e) => {
            log::error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    for line in &commands {
        console_command(&mut ctx, line);
    }
    if ctx.sv.state == ServerState::Dead {
        sv_spawn_server(&mut ctx, DEFAULT_MAP, &[]);
    }

    let console = spawn_console();
    let mut oldtime = sys_milliseconds();

    'main: loop {
        // sleep until the next frame is due, waking often enough to
        // keep connection handshakes responsive
        let wait = sv_time_to_next_frame(&ctx).clamp(1, 10);
        std::thread::sleep(Duration::from_millis(wait as u64));

        while let Ok(line) = console.try_recv() {
            if !console_command(&mut ctx, &line) {
                break 'main;
            }
        }

        let newtime = sys_milliseconds();
        let msec = newtime - oldtime;
        if msec < 1 {
            continue;
        }
        oldtime = newtime;

        sv_frame(&mut ctx, msec);
        if !ctx.svs.initialized {
            break; // killserver
        }
    }

    if ctx.svs.initialized {
        sv_shutdown(&mut ctx, "Server quit\n", false);
    }
    log::info!("Server shutting down");
    ExitCode::SUCCESS
}
