// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![doc = "Host binary exercising the Amber engine against the in-process parent."]

use amber_keep::config::Config;
use amber_keep::inproc::InProcParent;
use amber_keep::Engine;
use anyhow::Result;

/// Host entry point: bring up an engine over the in-process parent, run one
/// bootstrap child through a checkpoint, and report the snapshot size. The
/// production launcher wires the engine to a real parent environment
/// instead.
fn main() -> Result<()> {
    env_logger::init();

    let parent = InProcParent::new();
    let engine = Engine::new(parent.parent(), Config::default());
    engine
        .pd_root()
        .create_session("ram_quota=1048576, label=\"hello\"")?;
    engine
        .cpu_root()
        .create_session("ram_quota=131072, label=\"hello\"")?;
    engine
        .ram_root()
        .create_session("ram_quota=1048576, label=\"hello\"")?;

    let blob = engine.checkpoint(false)?;
    println!("checkpoint of bootstrap child: {} bytes", blob.size);
    Ok(())
}
