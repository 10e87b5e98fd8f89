use std::io::Write;

use ftp_crawl_rs::targets::{load_host_list, load_nmap_report, parse_host_list_str, parse_nmap_xml_str};
use ftp_crawl_rs::types::Target;

const NMAP_REPORT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE nmaprun>
<nmaprun scanner="nmap" args="nmap -p 21,2121 -oX scan.xml 192.0.2.0/29" start="1700000000" version="7.94">
  <host starttime="1700000001" endtime="1700000002">
    <status state="up" reason="syn-ack"/>
    <address addr="192.0.2.3" addrtype="ipv4"/>
    <address addr="00:11:22:33:44:55" addrtype="mac" vendor="Example"/>
    <ports>
      <port protocol="tcp" portid="21">
        <state state="open" reason="syn-ack" reason_ttl="64"/>
        <service name="ftp" method="table" conf="3"/>
      </port>
      <port protocol="tcp" portid="2121">
        <state state="open" reason="syn-ack" reason_ttl="64"/>
        <service name="ccproxy-ftp" method="table" conf="3"/>
      </port>
    </ports>
  </host>
  <host>
    <status state="up" reason="syn-ack"/>
    <address addr="192.0.2.4" addrtype="ipv4"/>
    <ports>
      <port protocol="tcp" portid="21">
        <state state="closed" reason="reset"/>
        <service name="ftp" method="table" conf="3"/>
      </port>
      <port protocol="tcp" portid="2121">
        <state state="open" reason="syn-ack"/>
        <service name="ftp" product="vsftpd" method="probed" conf="10"/>
      </port>
    </ports>
  </host>
  <host>
    <status state="down" reason="no-response"/>
    <address addr="192.0.2.5" addrtype="ipv4"/>
  </host>
</nmaprun>
"#;

#[test]
fn nmap_report_keeps_open_ftp_ports() {
    let targets = parse_nmap_xml_str(NMAP_REPORT).unwrap();
    assert_eq!(
        targets,
        vec![Target::new("192.0.2.3", 21), Target::new("192.0.2.4", 2121)]
    );
}

#[test]
fn nmap_report_requires_nmaprun_root() {
    assert!(parse_nmap_xml_str("<?xml version=\"1.0\"?><hosts/>").is_err());
    assert!(parse_nmap_xml_str("<nmaprun><host></nmaprun>").is_err());
}

#[test]
fn host_list_skips_comments_and_bad_lines() {
    let content = "\
# anonymous mirrors
203.0.113.5
ftp.example.org:2121   # mirror
not a host

[2001:db8::1]:990
192.0.2.0/31
";
    let targets = parse_host_list_str(content, 21);
    let got: Vec<String> = targets.iter().map(|t| t.authority()).collect();
    assert_eq!(
        got,
        vec![
            "203.0.113.5:21",
            "ftp.example.org:2121",
            "[2001:db8::1]:990",
            "192.0.2.0:21",
            "192.0.2.1:21",
        ]
    );
}

#[test]
fn load_from_files() {
    let mut hosts = tempfile::NamedTempFile::new().unwrap();
    writeln!(hosts, "203.0.113.5\n203.0.113.6:2100").unwrap();
    let targets = load_host_list(hosts.path(), 2121).unwrap();
    assert_eq!(
        targets,
        vec![Target::new("203.0.113.5", 2121), Target::new("203.0.113.6", 2100)]
    );

    let mut report = tempfile::NamedTempFile::new().unwrap();
    report.write_all(NMAP_REPORT.as_bytes()).unwrap();
    assert_eq!(load_nmap_report(report.path()).unwrap().len(), 2);
}

#[test]
fn missing_files_are_errors() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope.txt");
    let err = load_host_list(&missing, 21).unwrap_err();
    assert!(format!("{err:#}").contains("failed to read host list"));
    assert!(load_nmap_report(&missing).is_err());
}
