// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use clap::Parser as _;
use rcbench_bin::Res;

fn main() -> Res<()> {
    let args = rcbench_bin::client::Args::parse();

    rcbench_bin::client::run(&args)
}
