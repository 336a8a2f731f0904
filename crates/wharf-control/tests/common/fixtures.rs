//! Test fixtures for wharf-control integration tests.

use wharf_control::{BuildSpecInput, CreateDeployment};

pub const REPO_URL: &str = "https://github.com/acme/storefront.git";

/// A deterministic 40-character commit SHA.
pub fn commit(n: u8) -> String {
    format!("{n:02x}").repeat(20)
}

/// Builder for creating test deployment requests.
pub struct DeploymentRequest {
    repo_url: String,
    branch: String,
    spec: BuildSpecInput,
}

impl DeploymentRequest {
    /// A node application on `port`.
    pub fn node(port: u16) -> Self {
        Self {
            repo_url: REPO_URL.to_owned(),
            branch: "main".to_owned(),
            spec: BuildSpecInput {
                language: Some("node".to_owned()),
                exposed_port: Some(port),
                ..BuildSpecInput::default()
            },
        }
    }

    pub fn python(port: u16) -> Self {
        Self::node(port).with_language("python")
    }

    pub fn with_repo(mut self, url: &str) -> Self {
        self.repo_url = url.to_owned();
        self
    }

    pub fn with_branch(mut self, branch: &str) -> Self {
        self.branch = branch.to_owned();
        self
    }

    pub fn with_language(mut self, language: &str) -> Self {
        self.spec.language = Some(language.to_owned());
        self
    }

    pub fn without_language(mut self) -> Self {
        self.spec.language = None;
        self
    }

    pub fn without_port(mut self) -> Self {
        self.spec.exposed_port = None;
        self
    }

    pub fn with_runtime_image(mut self, image: &str) -> Self {
        self.spec.runtime_image = Some(image.to_owned());
        self
    }

    pub fn with_start_command(mut self, command: &str) -> Self {
        self.spec.start_command = Some(command.to_owned());
        self
    }

    pub fn spec(&self) -> BuildSpecInput {
        self.spec.clone()
    }

    pub fn build(self) -> CreateDeployment {
        CreateDeployment {
            repo_url: self.repo_url,
            branch: self.branch,
            build_spec: self.spec,
        }
    }
}
