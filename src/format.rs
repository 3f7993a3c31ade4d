//! Rendering of workflow results.

use anyhow::Error;

use crate::config::OutputFormat;
use crate::workflow::duplicates::DuplicateGroup;
use crate::workflow::status::StatusReport;

pub fn render_status(report: &StatusReport, format: OutputFormat) -> Result<String, Error> {
    match format {
        OutputFormat::Json => Ok(serde_json::to_string_pretty(report)?),
        // fdupes output only makes sense for duplicate listings
        OutputFormat::Human | OutputFormat::Fdupes => {
            let mut out = String::new();
            for path in &report.modified {
                out.push_str(&format!("modified: {}\n", path));
            }
            for path in &report.added {
                out.push_str(&format!("added: {}\n", path));
            }
            for path in &report.deleted {
                out.push_str(&format!("deleted: {}\n", path));
            }
            if report.is_empty() {
                out.push_str("clean\n");
            }
            Ok(out)
        }
    }
}

pub fn render_duplicates(
    groups: &[DuplicateGroup],
    format: OutputFormat,
) -> Result<String, Error> {
    match format {
        OutputFormat::Json => Ok(serde_json::to_string_pretty(groups)?),
        OutputFormat::Fdupes => {
            // fdupes style: bare paths, groups separated by blank lines
            let mut out = String::new();
            for (n, group) in groups.iter().enumerate() {
                if n > 0 {
                    out.push('\n');
                }
                for path in &group.paths {
                    out.push_str(path);
                    out.push('\n');
                }
            }
            Ok(out)
        }
        OutputFormat::Human => {
            let mut out = String::new();
            for group in groups {
                out.push_str(&format!("{}:\n", group.digest));
                for path in &group.paths {
                    out.push_str(&format!("  {}\n", path));
                }
            }
            if groups.is_empty() {
                out.push_str("no duplicates\n");
            }
            Ok(out)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_rendering() {
        let report = StatusReport {
            modified: vec!["a.txt".into()],
            added: vec!["e.txt".into()],
            deleted: vec!["d.txt".into()],
        };
        let human = render_status(&report, OutputFormat::Human).unwrap();
        assert_eq!(human, "modified: a.txt\nadded: e.txt\ndeleted: d.txt\n");

        let json = render_status(&report, OutputFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["added"][0], "e.txt");

        let empty = render_status(&StatusReport::default(), OutputFormat::Human).unwrap();
        assert_eq!(empty, "clean\n");
    }

    #[test]
    fn fdupes_rendering() {
        let groups = vec![
            DuplicateGroup {
                digest: "aa".into(),
                paths: vec!["x".into(), "y".into()],
            },
            DuplicateGroup {
                digest: "bb".into(),
                paths: vec!["p".into(), "q".into()],
            },
        ];
        let out = render_duplicates(&groups, OutputFormat::Fdupes).unwrap();
        assert_eq!(out, "x\ny\n\np\nq\n");
    }
}
