// CLI command handlers
use anyhow::{bail, Context, Result};
use log::info;
use std::fs;
use std::path::Path;
use std::time::Duration;

use cellhle_core::runtime::hle::function_id;
use cellhle_core::runtime::spu::regs::{
    raw_spu_reg_addr, LS_SIZE, SPU_MBOX_STATUS, SPU_NPC, SPU_OUT_MBOX, SPU_RUNCNTL_RUNNABLE,
    SPU_RUN_CNTL, SPU_STATUS,
};
use cellhle_core::runtime::spu::RunState;
use cellhle_core::{EmuSettings, EmulationSession};

pub fn print_function_ids(names: &[String]) {
    for name in names {
        println!("0x{:08X}  {}", function_id(name), name);
    }
}

pub fn settings_show(path: &Path) -> Result<()> {
    let settings = EmuSettings::load(path)?;
    println!("# {}", path.display());
    let content = serde_json::to_string_pretty(&settings).context("Failed to format settings")?;
    println!("{}", content);
    Ok(())
}

pub fn settings_reset(path: &Path) -> Result<()> {
    EmuSettings::default().save(path)?;
    println!("Settings reset: {}", path.display());
    Ok(())
}

pub fn settings_set_hle_logging(path: &Path, enabled: bool) -> Result<()> {
    let mut settings = EmuSettings::load(path)?;
    settings.hle.logging = enabled;
    settings.save(path)?;
    println!("HLE logging {}", if enabled { "on" } else { "off" });
    Ok(())
}

pub fn run_spu(config: &Path, image: &Path, index: u32, entry: u32, timeout_ms: u64) -> Result<()> {
    let settings = EmuSettings::load(config)?;
    let data = fs::read(image)
        .with_context(|| format!("Failed to read local store image: {}", image.display()))?;
    if data.len() > LS_SIZE as usize {
        bail!(
            "Image is 0x{:X} bytes, local store holds 0x{:X}",
            data.len(),
            LS_SIZE
        );
    }

    let session = EmulationSession::new(&settings)?;
    let spu = session
        .create_raw_spu(index)
        .with_context(|| format!("Failed to create raw SPU {}", index))?;
    spu.local_store()
        .write(0, &data)
        .context("Failed to load local store image")?;
    info!("loaded 0x{:X} bytes into RawSPU[{}]", data.len(), index);

    let reg = |offset| raw_spu_reg_addr(index, offset);
    session.write32(reg(SPU_NPC), entry)?;
    session.write32(reg(SPU_RUN_CNTL), SPU_RUNCNTL_RUNNABLE)?;

    let state = spu.wait_while_running(Duration::from_millis(timeout_ms));
    let status = session.read32(reg(SPU_STATUS))?;
    let npc = session.read32(reg(SPU_NPC))?;
    let context = spu.context();

    println!("RawSPU[{}]", index);
    println!("  State:   {:?}", state);
    println!("  Status:  0x{:08X}", status);
    println!("  NPC:     0x{:05X}", npc);
    println!("  Retired: {}", context.retired);
    if session.read32(reg(SPU_MBOX_STATUS))? & 0xFF != 0 {
        println!("  Out mailbox: 0x{:08X}", session.read32(reg(SPU_OUT_MBOX))?);
    }

    if state == RunState::Running {
        bail!("RawSPU[{}] still running after {} ms", index, timeout_ms);
    }
    Ok(())
}
