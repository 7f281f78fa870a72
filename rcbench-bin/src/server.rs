// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::net::IpAddr;

use clap::Parser;
use rcbench_transport::{run, stream::Connection, Role};

use crate::{report, report_raw, Res, SharedArgs};

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(flatten)]
    shared: SharedArgs,

    /// Address to listen on. Defaults to all interfaces.
    #[arg(short = 'a', long)]
    address: Option<IpAddr>,
}

pub fn run(args: &Args) -> Res<()> {
    rcbench_common::log::init(Some(args.shared.log_level_filter()));
    let cfg = args.shared.config(Role::Server, args.address, None);
    let mut conn = Connection::establish(&cfg)?;
    let result = run::run(&mut conn, &cfg)?;
    conn.close();
    if args.shared.raw {
        print!("{}", report_raw(&cfg, result));
    } else {
        print!("{}", report(&cfg, result));
    }
    Ok(())
}
