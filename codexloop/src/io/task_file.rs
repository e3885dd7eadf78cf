//! TOML task files for `task -f` and `foreach`.
//!
//! Every text field may contain `{{item}}`, replaced verbatim by the batch
//! item. There is no template evaluation beyond that one substitution.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;

use crate::core::bound::IterationBound;
use crate::task::{CheckPolicy, TaskDefinition};

pub const ITEM_PLACEHOLDER: &str = "{{item}}";

const TASK_FILE_TEMPLATE: &str = r#"# Task file for `codexloop task -f` and `codexloop foreach`.
# Any field may use {{item}}; it is replaced by the current list item.

# Required. What the agent should do.
prompt = """
Describe the task for {{item}} here.
"""

# Optional. Runs before the task, e.g. create a branch for {{item}}.
# set_up = """
# """

# Optional. How to verify the work, e.g. run the tests and check none are skipped.
# Use "None" to skip verification. When absent, the prompt itself is checked.
# check = """
# """

# Optional. Follow-up after success, e.g. commit and open a pull request.
# on_success = """
# """

# Optional. Follow-up after failure, e.g. revert and abandon the branch.
# on_failure = """
# """

# Optional. Cleanup after the task finishes either way.
# tear_down = """
# """

# Optional (default 10). 0 means unlimited.
# max_iterations = 10
"#;

/// Raw task file contents. Blank strings count as absent.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskFile {
    pub prompt: String,
    #[serde(default)]
    pub set_up: Option<String>,
    #[serde(default)]
    pub tear_down: Option<String>,
    #[serde(default)]
    pub check: Option<String>,
    #[serde(default)]
    pub on_success: Option<String>,
    #[serde(default)]
    pub on_failure: Option<String>,
    #[serde(default)]
    pub max_iterations: Option<IterationBound>,
}

impl TaskFile {
    pub fn parse(contents: &str) -> Result<Self> {
        let file: TaskFile = toml::from_str(contents)?;
        if file.prompt.trim().is_empty() {
            bail!("task file missing non-empty 'prompt'");
        }
        Ok(file)
    }

    /// True when any field references `{{item}}`.
    pub fn uses_item(&self) -> bool {
        self.texts().any(|text| text.contains(ITEM_PLACEHOLDER))
    }

    /// Build the definition for one run, substituting `item` when given.
    ///
    /// `default_bound` applies when the file sets no `max_iterations`.
    pub fn to_definition(
        &self,
        item: Option<&str>,
        default_bound: IterationBound,
    ) -> Result<TaskDefinition> {
        match (item, self.uses_item()) {
            (Some(_), false) => bail!("an item was given but the task file never uses {{{{item}}}}"),
            (None, true) => bail!("the task file uses {{{{item}}}} but no item was given"),
            _ => {}
        }
        let render = |text: &Option<String>| -> Option<String> {
            let text = text.as_deref().filter(|t| !t.trim().is_empty())?;
            Some(match item {
                Some(item) => text.replace(ITEM_PLACEHOLDER, item),
                None => text.to_string(),
            })
        };

        let prompt = render(&Some(self.prompt.clone()))
            .ok_or_else(|| anyhow!("task file missing non-empty 'prompt'"))?;
        let mut definition = TaskDefinition::new(prompt)?
            .with_check(CheckPolicy::from_text(render(&self.check).as_deref()))
            .with_max_iterations(self.max_iterations.unwrap_or(default_bound));
        definition.set_up = render(&self.set_up);
        definition.tear_down = render(&self.tear_down);
        definition.on_success = render(&self.on_success);
        definition.on_failure = render(&self.on_failure);
        Ok(definition)
    }

    fn texts(&self) -> impl Iterator<Item = &str> {
        [
            Some(&self.prompt),
            self.set_up.as_ref(),
            self.tear_down.as_ref(),
            self.check.as_ref(),
            self.on_success.as_ref(),
            self.on_failure.as_ref(),
        ]
        .into_iter()
        .flatten()
        .map(String::as_str)
    }
}

pub fn load_task_file(path: &Path) -> Result<TaskFile> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    TaskFile::parse(&contents).with_context(|| format!("parse task file {}", path.display()))
}

/// Write the commented template to `path` (`.toml` appended when missing).
///
/// Refuses to overwrite anything. Returns the path actually written.
pub fn create_task_file(path: &Path) -> Result<PathBuf> {
    let target = if path.extension().is_some_and(|ext| ext == "toml") {
        path.to_path_buf()
    } else {
        PathBuf::from(format!("{}.toml", path.display()))
    };
    if target.is_dir() {
        bail!("{} is a directory", target.display());
    }
    let mut file = match OpenOptions::new().write(true).create_new(true).open(&target) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            bail!("{} already exists", target.display())
        }
        Err(err) if err.kind() == ErrorKind::NotFound => {
            let parent = target.parent().unwrap_or(Path::new("."));
            bail!("directory does not exist: {}", parent.display())
        }
        Err(err) => return Err(err).with_context(|| format!("create {}", target.display())),
    };
    file.write_all(TASK_FILE_TEMPLATE.as_bytes())
        .with_context(|| format!("write {}", target.display()))?;
    Ok(target)
}
