//! P4 artifact generation: compile the program, then build the pipeline
//! binary with `ovs_pipeline_builder`.

use std::path::{Path, PathBuf};

use crate::config::{P4Arch, P4Config};
use crate::host::{Host, StepFailed};

/// Files `ovs-p4ctl set-pipe` needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifacts {
    pub dir: PathBuf,
    pub pb_bin: PathBuf,
    pub p4_info: PathBuf,
}

impl Artifacts {
    pub fn for_config(cfg: &P4Config) -> Self {
        let dir = cfg.artifacts_dir.clone();
        Self {
            pb_bin: dir.join(format!("{}.pb.bin", cfg.program)),
            p4_info: dir.join("p4Info.txt"),
            dir,
        }
    }

    pub fn pb_bin_str(&self) -> String {
        self.pb_bin.display().to_string()
    }

    pub fn p4_info_str(&self) -> String {
        self.p4_info.display().to_string()
    }
}

pub fn compile_command(cfg: &P4Config) -> String {
    let dir = cfg.artifacts_dir.display();
    let prog = &cfg.program;
    match cfg.arch {
        P4Arch::Psa => format!(
            "p4c --arch psa --target dpdk --output {dir}/pipe \
             --p4runtime-files {dir}/p4Info.txt --bf-rt-schema {dir}/bf-rt.json \
             --context {dir}/pipe/context.json {dir}/{prog}.p4"
        ),
        P4Arch::Pna => format!(
            "p4c-dpdk -I p4include -I p4include/dpdk --p4v=16 \
             --p4runtime-files {dir}/p4Info.txt -o {dir}/pipe/{prog}.spec --arch pna \
             --bf-rt-schema {dir}/bf-rt.json --context {dir}/pipe/context.json {dir}/{prog}.p4"
        ),
    }
}

pub fn pipeline_builder_command(dir: &Path, program: &str) -> String {
    format!(
        "cd {}; ovs_pipeline_builder --p4c_conf_file={program}.conf \
         --bf_pipeline_config_binary_file={program}.pb.bin",
        dir.display()
    )
}

/// Compile `cfg.program` for its architecture and build the pipeline
/// binary next to it.
pub fn generate(host: &mut Host, cfg: &P4Config) -> Result<Artifacts, StepFailed> {
    let compile = compile_command(cfg);
    host.run(&compile)?;
    tracing::info!(program = %cfg.program, arch = ?cfg.arch, "p4 program compiled");

    host.run(&pipeline_builder_command(&cfg.artifacts_dir, &cfg.program))?;
    let artifacts = Artifacts::for_config(cfg);
    tracing::info!(pb_bin = %artifacts.pb_bin.display(), "pipeline binary built");
    Ok(artifacts)
}
