//! Attack signature families. Compiled once, matched case-insensitively.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::ThreatKind;

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(&format!("(?i){}", p)).expect("Invalid firewall pattern"))
        .collect()
}

pub static SQL_INJECTION: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"\bunion\b(\s+all)?\s+select\b",
        r"\b(or|and)\s+['\x22]?\d+['\x22]?\s*=\s*['\x22]?\d+",
        r"'\s*(or|and)\s+'[^']*'\s*=\s*'",
        r";\s*(drop|delete|insert|update|alter|create|truncate)\s+(table|from|into|database)\b",
        r"\b(sleep|benchmark|pg_sleep)\s*\(\s*\d",
        r"\bwaitfor\s+delay\b",
        r"'\s*(--|#|/\*)",
        r"\binformation_schema\b",
        r"\b(load_file\s*\(|into\s+(out|dump)file\b)",
    ])
});

pub static XSS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"<\s*script\b",
        r"<\s*/\s*script\s*>",
        r"\bjavascript\s*:",
        r"\bvbscript\s*:",
        r"\bon(error|load|click|mouseover|mouseenter|focus|blur|submit|change|keydown|keyup|animationstart)\s*=",
        r"<\s*(iframe|object|embed|applet|meta|svg|base)\b",
        r"\bdocument\s*\.\s*(cookie|write|location)\b",
        r"\bexpression\s*\(",
        r"\bdata\s*:\s*text/html\b",
    ])
});

pub static FILE_INCLUSION: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"\.\.[/\\]",
        r"/etc/(passwd|shadow|group|hosts)\b",
        r"/proc/self/",
        r"\b(boot|win)\.ini\b",
        r"\x00",
        r"\b(include|require)(_once)?\s*\(?\s*['\x22]?(https?|ftp)://",
    ])
});

pub static COMMAND_INJECTION: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"(;|\|\|?|&&|`)\s*(cat|ls|id|whoami|uname|wget|curl|nc|netcat|bash|sh|rm|chmod|python|perl|ping)\b",
        r"\$\([^)]*\)",
        r"\$\{IFS\}",
        r"\b(system|exec|shell_exec|passthru|popen|proc_open)\s*\(",
    ])
});

pub static DANGEROUS_PROTOCOL: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[r"\b(file|gopher|phar|dict|expect|php|zip|glob|data|ldap|jar|tftp)://"])
});

/// Scanner and attack tool User-Agent fragments, lowercase.
pub const BAD_BOTS: &[&str] = &[
    "sqlmap",
    "nikto",
    "nmap",
    "masscan",
    "acunetix",
    "nessus",
    "openvas",
    "w3af",
    "dirbuster",
    "gobuster",
    "wpscan",
    "havij",
    "zgrab",
    "nuclei",
    "wfuzz",
    "hydra",
    "netsparker",
    "appscan",
    "whatweb",
    "zmeu",
];

/// Families in scan order.
pub fn families() -> [(ThreatKind, &'static [Regex]); 5] {
    [
        (ThreatKind::SqlInjection, SQL_INJECTION.as_slice()),
        (ThreatKind::Xss, XSS.as_slice()),
        (ThreatKind::FileInclusion, FILE_INCLUSION.as_slice()),
        (ThreatKind::CommandInjection, COMMAND_INJECTION.as_slice()),
        (ThreatKind::DangerousProtocol, DANGEROUS_PROTOCOL.as_slice()),
    ]
}

/// First family matching `value`.
pub fn classify(value: &str) -> Option<ThreatKind> {
    families()
        .into_iter()
        .find(|(_, patterns)| patterns.iter().any(|re| re.is_match(value)))
        .map(|(kind, _)| kind)
}

pub fn is_bad_bot(user_agent: &str) -> bool {
    let ua = user_agent.to_lowercase();
    BAD_BOTS.iter().any(|bot| ua.contains(bot))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_each_family() {
        assert_eq!(classify("1 UNION ALL SELECT password"), Some(ThreatKind::SqlInjection));
        assert_eq!(classify("admin' OR '1'='1"), Some(ThreatKind::SqlInjection));
        assert_eq!(classify("<script>alert(1)</script>"), Some(ThreatKind::Xss));
        assert_eq!(classify("<img src=x onerror=alert(1)>"), Some(ThreatKind::Xss));
        assert_eq!(classify("../../etc/passwd"), Some(ThreatKind::FileInclusion));
        assert_eq!(classify("x; cat /tmp/secret"), Some(ThreatKind::CommandInjection));
        assert_eq!(classify("gopher://127.0.0.1:6379/_"), Some(ThreatKind::DangerousProtocol));
        assert_eq!(classify("phar://upload.jpg"), Some(ThreatKind::DangerousProtocol));
    }

    #[test]
    fn test_benign_input() {
        for value in [
            "/blog/hello-world",
            "page=2&sort=desc&id=5",
            "Select the best option from the menu",
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko)",
            "https://example.com/about-us",
            "It's -- honestly -- great",
        ] {
            assert_eq!(classify(value), None, "false positive on {value}");
        }
    }

    #[test]
    fn test_bad_bots_case_insensitive() {
        assert!(is_bad_bot("sqlmap/1.7.2#stable (https://sqlmap.org)"));
        assert!(is_bad_bot("Mozilla/5.00 (Nikto/2.1.6)"));
        assert!(!is_bad_bot("Mozilla/5.0 (X11; Linux x86_64) Firefox/120.0"));
    }
}
