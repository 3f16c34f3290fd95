use std::env;
use std::process::exit;
use std::rc::Rc;

use rudis::config::Config;
use rudis::eventloop::{EventLoop, Mask};
use rudis::handler::{accept_handler, before_sleep, server_cron};
use rudis::server::Server;
use rudis::util::{log, LogLevel};

const CRON_INTERVAL_MS: u128 = 100;

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        eprintln!("Usage: {} /path/to/config.json", args.first().map(String::as_str).unwrap_or("rudis-server"));
        exit(1);
    }

    let config = match Config::load(&args[1]) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            exit(1);
        }
    };

    let loglevel = LogLevel::from_str(&config.loglevel).unwrap_or(LogLevel::Notice);

    let server = match Server::new(config.port, &config.bind, loglevel, config.logfile.clone()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("can't start server: {e}");
            exit(1);
        }
    };

    let mut el = match EventLoop::create() {
        Ok(el) => el,
        Err(e) => {
            eprintln!("can't create event loop: {e}");
            exit(1);
        }
    };

    let listen_fd = server.borrow().fd;
    let srv_for_accept = server.clone();
    if let Err(e) = el.create_file_event(
        listen_fd,
        Mask::Readable,
        Rc::new(move |el, fd, mask| accept_handler(&srv_for_accept, el, fd, mask)),
    ) {
        eprintln!("can't register accept handler: {e}");
        exit(1);
    }

    let srv_for_cron = server.clone();
    el.create_time_event(
        CRON_INTERVAL_MS,
        Rc::new(move |el, id| server_cron(&srv_for_cron, el, id)),
        None,
    );

    let srv_for_sleep = server.clone();
    el.set_before_sleep_proc(Some(Rc::new(move |el| before_sleep(&srv_for_sleep, el))));

    log(
        loglevel,
        LogLevel::Notice,
        &server.borrow().logfile,
        &format!("The server is now ready to accept connections on port {}", config.port),
    );

    el.main();
}
