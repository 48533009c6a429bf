// SPDX-License-Identifier: GPL-2.0-or-later

use std::process::exit;

fn main() {
    exit(qemu_compose::main(std::env::args()))
}
