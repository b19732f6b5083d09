use std::path::Path;

use clap::ValueEnum;

use crate::job::Job;

/// Tools the console knows how to check before anything is deployed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Tool {
    Proxmox,
    Ansible,
    Terraform,
    Packer,
    DevAuth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Check {
    pub name: &'static str,
    pub argv: &'static [&'static str],
}

const fn shell(name: &'static str, argv: &'static [&'static str]) -> Check {
    Check { name, argv }
}

const PROXMOX: &[Check] = &[
    shell("pvesh present", &["bash", "-lc", "command -v pvesh && pvesh version"]),
    shell("qm present", &["bash", "-lc", "command -v qm && qm --version || true"]),
    shell(
        "pvecm (cluster) present",
        &["bash", "-lc", "command -v pvecm && pvecm status || true"],
    ),
];

const ANSIBLE: &[Check] = &[
    shell(
        "ansible-playbook present",
        &["bash", "-lc", "command -v ansible-playbook && ansible-playbook --version"],
    ),
    shell(
        "ansible-galaxy present",
        &["bash", "-lc", "command -v ansible-galaxy && ansible-galaxy --version"],
    ),
];

const TERRAFORM: &[Check] = &[shell(
    "terraform present",
    &["bash", "-lc", "command -v terraform && terraform version"],
)];

const PACKER: &[Check] = &[shell(
    "packer present",
    &["bash", "-lc", "command -v packer && packer version"],
)];

const DEV_AUTH: &[Check] = &[shell(
    "authentication (git + gh)",
    &["bash", "scripts/core/dev-auth.sh", "all"],
)];

impl Tool {
    pub const ALL: [Tool; 5] = [
        Tool::Proxmox,
        Tool::Ansible,
        Tool::Terraform,
        Tool::Packer,
        Tool::DevAuth,
    ];

    pub fn title(self) -> &'static str {
        match self {
            Tool::Proxmox => "Proxmox",
            Tool::Ansible => "Ansible",
            Tool::Terraform => "Terraform",
            Tool::Packer => "Packer",
            Tool::DevAuth => "Dev tools",
        }
    }

    pub fn checks(self) -> &'static [Check] {
        match self {
            Tool::Proxmox => PROXMOX,
            Tool::Ansible => ANSIBLE,
            Tool::Terraform => TERRAFORM,
            Tool::Packer => PACKER,
            Tool::DevAuth => DEV_AUTH,
        }
    }

    pub fn job_name(self, check: &Check) -> String {
        match self {
            // the auth script is an action, not a probe
            Tool::DevAuth => format!("{}: {}", self.title(), check.name),
            _ => format!("{} preflight: {}", self.title(), check.name),
        }
    }

    /// One job per check, all run from the app root.
    pub fn jobs(self, root: &Path) -> Vec<Job> {
        self.checks()
            .iter()
            .map(|check| Job::new(self.job_name(check), check.argv.iter().copied(), root))
            .collect()
    }
}
