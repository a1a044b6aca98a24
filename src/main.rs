use natlink::{Config, Event, SessionController, StunServer, Transport};
use std::io::{stdin, BufRead, Result};
use std::net::SocketAddr;
use std::sync::mpsc::{channel, Receiver};
use std::thread::spawn;
use std::time::Duration;
use structopt::StructOpt;

#[derive(StructOpt, Debug)]
#[structopt(name = "natlink")]
struct Opt {
    #[structopt(long = "bind", default_value = "0.0.0.0:0")]
    bind_addr: SocketAddr,

    #[structopt(long = "stun-server", default_value = "stun.miwifi.com:3478")]
    stun_server: StunServer,

    /// second STUN server, tells whether the NAT is symmetric
    #[structopt(long = "nat-check-server", default_value = "stun.l.google.com:19302")]
    nat_check_server: StunServer,

    /// skip STUN, announce the local address
    #[structopt(long = "no-stun")]
    no_stun: bool,

    /// STUN timeout in milliseconds
    #[structopt(long = "stun-timeout", default_value = "3000")]
    stun_timeout: u64,

    /// udp or tcp
    #[structopt(long = "transport", default_value = "udp")]
    transport: Transport,

    /// punch towards this peer right away
    #[structopt(long = "remote-peer")]
    remote_peer: Option<String>,

    /// request a port mapping from the gateway (UPnP)
    #[structopt(long = "upnp")]
    upnp: bool,
}

const HELP: &str = "commands: connect <ip:port> | list | send [@<ip:port>] <text> | disconnect <ip:port> | exit";

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opt = Opt::from_args();
    let config = Config {
        bind_addr: opt.bind_addr,
        stun_server: (!opt.no_stun).then_some(opt.stun_server),
        nat_check_server: (!opt.no_stun).then_some(opt.nat_check_server),
        stun_timeout: Duration::from_millis(opt.stun_timeout),
        transport: opt.transport,
        upnp: opt.upnp,
        ..Default::default()
    };

    let (tx, rx) = channel();
    let mut session = match SessionController::new(config, tx) {
        Ok(s) => s,
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(1);
        }
    };
    spawn(move || render(rx));

    log::info!(
        "public endpoint {} (local {}, NAT {}), give it to your peer",
        session.public_endpoint(),
        session.local_endpoint(),
        session.nat_type()
    );

    let started = match &opt.remote_peer {
        Some(peer) => session.start_as_initiator(peer).map(|_| ()),
        None => session.start_as_responder(),
    };
    if let Err(e) = started {
        log::warn!("{}", e);
    }

    log::info!("{}", HELP);
    for line in stdin().lock().lines() {
        let line = line?;
        if !run_command(&session, line.trim()) {
            break;
        }
    }

    session.shutdown();
    Ok(())
}

/// returns false on `exit`
fn run_command(session: &SessionController, line: &str) -> bool {
    let (cmd, arg) = match line.split_once(' ') {
        Some((cmd, arg)) => (cmd, arg.trim()),
        None => (line, ""),
    };

    let result = match cmd {
        "" => Ok(()),
        "exit" | "quit" => return false,
        "help" => {
            log::info!("{}", HELP);
            Ok(())
        }
        "connect" => session.connect(arg).map(|ep| log::info!("punching {}", ep)),
        "disconnect" => session.disconnect(arg),
        "list" => {
            for ep in session.list_peers() {
                let state = session.peer(&ep).map(|c| c.state());
                log::info!("{} {:?}", ep, state);
            }
            Ok(())
        }
        "send" => match arg.strip_prefix('@').and_then(|a| a.split_once(' ')) {
            Some((target, text)) => session.send(text, Some(target)).map(|_| ()),
            None => session.send(arg, None).map(|_| ()),
        },
        _ => session.send(line, None).map(|d| {
            if d.sent.is_empty() {
                log::info!("no connected peer, {}", HELP);
            }
        }),
    };

    if let Err(e) = result {
        log::warn!("{}", e);
    }
    true
}

fn render(rx: Receiver<Event>) {
    for ev in rx {
        match ev {
            Event::Connected(ep) => log::info!("[{}] connected", ep),
            Event::Message { from, payload } => log::info!("[MSG] [{}] {}", from, payload),
            Event::Closed(ep) => log::info!("[{}] closed", ep),
        }
    }
}
