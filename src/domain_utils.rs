/// Address and domain helpers shared by the classifier, the DKIM pipeline and
/// the send-request admission.
pub struct DomainUtils;

impl DomainUtils {
    /// Bare address out of a header value such as
    /// `=?utf-8?B?...?= <user@example.com>`. Values without angle brackets are
    /// returned unchanged.
    pub fn email_get_raw(email_full: &str) -> String {
        let email_full = email_full.trim();
        let Some(at_pos) = email_full.find('@') else {
            return email_full.to_string();
        };
        let Some(less_pos) = email_full[..at_pos].rfind('<') else {
            return email_full.to_string();
        };
        let rest = &email_full[less_pos + 1..];
        let end = rest[at_pos - less_pos..]
            .find('>')
            .map(|i| i + at_pos - less_pos)
            .unwrap_or(rest.len());
        rest[..end].trim().to_string()
    }

    /// Domain part of an address (everything after the first `@` of the bare
    /// address). A value without `@` is treated as a bare domain.
    pub fn email_get_domain(email_full: &str) -> String {
        let raw = Self::email_get_raw(email_full);
        Self::string_remove_starts_with(&raw, "@").to_string()
    }

    /// Everything after the first occurrence of `prefix`, or the whole string.
    pub fn string_remove_starts_with<'a>(s: &'a str, prefix: &str) -> &'a str {
        match s.find(prefix) {
            Some(index) => &s[index + prefix.len()..],
            None => s,
        }
    }

    /// Ancestors of a domain, nearest first:
    /// `a.b.example.com` -> `b.example.com`, `example.com`, `com`.
    pub fn parent_domains(domain: &str) -> Vec<&str> {
        domain
            .match_indices('.')
            .map(|(index, _)| &domain[index + 1..])
            .filter(|parent| !parent.is_empty())
            .collect()
    }

    pub fn count_at_symbols(value: &str) -> usize {
        value.matches('@').count()
    }

    /// Minimal HTML escaping for header text shown back on status pages.
    pub fn escape_html(value: &str) -> String {
        let mut escaped = String::with_capacity(value.len());
        for c in value.chars() {
            match c {
                '&' => escaped.push_str("&amp;"),
                '<' => escaped.push_str("&lt;"),
                '>' => escaped.push_str("&gt;"),
                '"' => escaped.push_str("&quot;"),
                '\'' => escaped.push_str("&#39;"),
                '`' => escaped.push_str("&#96;"),
                '=' => escaped.push_str("&#61;"),
                _ => escaped.push(c),
            }
        }
        escaped
    }
}
