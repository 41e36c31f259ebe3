//! Renders man pages for `nicos` and each visible subcommand into
//! `$OUT_DIR/man`, named `nicos.1`, `nicos-move.1` and so on.

use std::io;
use std::path::Path;

use clap::{Command, CommandFactory};

// The CLI definition is self-contained (clap, clap_complete and humantime
// are build-dependencies), so the build script can compile it on its own.
#[path = "src/cli.rs"]
#[allow(dead_code)]
mod cli;

fn main() {
    println!("cargo::rerun-if-changed=src/cli.rs");

    let Some(out_dir) = std::env::var_os("OUT_DIR") else {
        panic!("cargo did not set OUT_DIR");
    };
    let man_dir = Path::new(&out_dir).join("man");
    if let Err(e) = write_pages(cli::Cli::command(), &man_dir) {
        panic!("cannot write man pages to {}: {e}", man_dir.display());
    }
}

fn write_pages(root: Command, dir: &Path) -> io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let mut pending = vec![root];
    while let Some(cmd) = pending.pop() {
        let page = cmd.get_name().to_owned();
        pending.extend(
            cmd.get_subcommands()
                .filter(|sub| !sub.is_hide_set())
                .map(|sub| sub.clone().name(format!("{page}-{}", sub.get_name()))),
        );

        let mut roff = Vec::new();
        clap_mangen::Man::new(cmd).render(&mut roff)?;
        std::fs::write(dir.join(format!("{page}.1")), roff)?;
    }
    Ok(())
}
