//! CSV export of stored entries, one row per entry with tags joined by `;`.
use std::path::Path;

use anyhow::Result;
use csv::Writer;

use crate::store::StoredEntry;

const HEADER: [&str; 13] = [
    "id",
    "username",
    "password",
    "address",
    "scheme",
    "port",
    "url_path",
    "ip_address",
    "title",
    "file_name",
    "line_number",
    "application",
    "tags",
];

pub fn save_entries_csv<P: AsRef<Path>>(entries: &[StoredEntry], path: P) -> Result<()> {
    let mut wtr = Writer::from_path(path)?;
    wtr.write_record(HEADER)?;
    for e in entries {
        let r = &e.record;
        wtr.write_record([
            e.id.to_string(),
            r.username.clone(),
            r.password.clone(),
            r.address.clone(),
            r.scheme.clone().unwrap_or_default(),
            r.port.map(|p| p.to_string()).unwrap_or_default(),
            r.url_path.clone().unwrap_or_default(),
            r.ip_address.clone().unwrap_or_default(),
            r.title.clone().unwrap_or_default(),
            r.file_name.clone(),
            r.line_number.to_string(),
            r.application.clone().unwrap_or_default(),
            r.tags.join(";"),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::OutputRecord;
    use tempfile::tempdir;

    #[test]
    fn writes_header_and_rows() {
        let entries = vec![StoredEntry {
            id: 1,
            record: OutputRecord {
                username: "bob".into(),
                password: "hunter2".into(),
                address: "https://a.com".into(),
                scheme: Some("https".into()),
                port: Some(8443),
                url_path: Some("/login".into()),
                ip_address: Some("10.0.0.2".into()),
                title: Some("Sign in, please".into()),
                file_name: "dump.txt".into(),
                line_number: 4,
                application: None,
                tags: vec!["resolved".into(), "success".into(), "login".into()],
            },
        }];
        let dir = tempdir().unwrap();
        let path = dir.path().join("entries.csv");
        save_entries_csv(&entries, &path).unwrap();
        let content = std::fs::read_to_string(path).unwrap();
        let mut lines = content.lines();
        assert_eq!(
            lines.next().unwrap(),
            "id,username,password,address,scheme,port,url_path,ip_address,title,file_name,line_number,application,tags"
        );
        assert_eq!(
            lines.next().unwrap(),
            "1,bob,hunter2,https://a.com,https,8443,/login,10.0.0.2,\"Sign in, please\",dump.txt,4,,resolved;success;login"
        );
    }
}
