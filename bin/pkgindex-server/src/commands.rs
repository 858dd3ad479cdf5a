//! Command execution against an open mirror stage

use crate::Command;
use anyhow::Result;
use pkgindex_mirror::{MirrorStage, SimpleLink};
use std::fmt::Write;
use tracing::info;

fn format_link(link: &SimpleLink) -> String {
    let mut line = format!("{} {}", link.basename, link.href);
    if let Some(requires_python) = &link.requires_python {
        let _ = write!(line, " requires-python={requires_python}");
    }
    if link.yanked.is_some() {
        line.push_str(" yanked");
    }
    line
}

pub async fn run(stage: &MirrorStage, command: Command) -> Result<()> {
    match command {
        Command::Links { project } => {
            for link in stage.get_links(&project).await? {
                println!("{}", format_link(&link));
            }
        }
        Command::Versions { project } => {
            for version in stage.list_versions(&project).await? {
                println!("{version}");
            }
        }
        Command::Projects => {
            for name in stage.list_projects().await?.iter() {
                println!("{name}");
            }
        }
        Command::Serial => {
            // an empty store reports -1
            match stage.keyfs().last_serial()? {
                Some(serial) => println!("{serial}"),
                None => println!("-1"),
            }
        }
        Command::Changelog { serial } => {
            let entry = stage.keyfs().read_changelog(serial)?;
            println!("{}", serde_json::to_string_pretty(&*entry)?);
        }
        Command::DeleteProject { project } => {
            stage.delete_project(&project)?;
            info!("Deleted project {} from {}", project, stage.name());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_link() {
        let mut link = SimpleLink {
            basename: "six-1.0.tar.gz".into(),
            href: "root/pypi/+f/3a5/a3d4a4e6f1b5c/six-1.0.tar.gz#sha256=00".into(),
            requires_python: None,
            yanked: None,
        };
        assert_eq!(
            format_link(&link),
            "six-1.0.tar.gz root/pypi/+f/3a5/a3d4a4e6f1b5c/six-1.0.tar.gz#sha256=00"
        );
        link.requires_python = Some(">=3.8".into());
        link.yanked = Some(String::new());
        assert!(format_link(&link).ends_with(" requires-python=>=3.8 yanked"));
    }
}
