//! Maps CSV rows onto contact fields and derives the natural key used for
//! duplicate detection.
//!
//! Dedup key precedence:
//! 1. `email:<trimmed lowercase email>` when the email contains `@`
//! 2. `linkedin:<url without scheme, www., query or trailing slash>`
//! 3. `name:<name>|<company>` with whitespace collapsed and lowercased
//!
//! A row with none of these cannot be keyed.

use crate::models::contact::NewContact;
use serde_json::{Map, Value};

/// Trim, drop a UTF-8 BOM, lowercase.
pub fn normalize_header(raw: &str) -> String {
    raw.trim_start_matches('\u{feff}').trim().to_lowercase()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Field {
    Name,
    FirstName,
    LastName,
    Email,
    Phone,
    Company,
    Title,
    LinkedinUrl,
    Location,
}

fn field_for(header: &str) -> Option<Field> {
    let folded = header.replace([' ', '-', '.'], "_");
    let field = match folded.as_str() {
        "name" | "full_name" | "fullname" | "contact_name" => Field::Name,
        "first_name" | "firstname" | "given_name" => Field::FirstName,
        "last_name" | "lastname" | "surname" | "family_name" => Field::LastName,
        "email" | "email_address" | "e_mail" | "work_email" => Field::Email,
        "phone" | "phone_number" | "mobile" | "telephone" => Field::Phone,
        "company" | "company_name" | "organization" | "organisation" | "account" => {
            Field::Company
        }
        "title" | "job_title" | "position" | "designation" => Field::Title,
        "linkedin" | "linkedin_url" | "linkedin_profile" | "profile_url" => Field::LinkedinUrl,
        "location" | "city" | "region" | "country" => Field::Location,
        _ => return None,
    };
    Some(field)
}

/// Column layout of one import, built from its header row.
#[derive(Clone, Debug)]
pub struct RowMapper {
    headers: Vec<String>,
    fields: Vec<Option<Field>>,
}

impl RowMapper {
    /// `headers` are expected to be normalized already.
    pub fn new(headers: Vec<String>) -> Self {
        let fields = headers.iter().map(|h| field_for(h)).collect();
        Self { headers, fields }
    }

    pub fn column_count(&self) -> usize {
        self.headers.len()
    }

    /// Build a contact from a row with exactly `column_count()` values.
    /// Returns `None` when no dedup key can be derived.
    pub fn map(&self, values: &[String]) -> Option<NewContact> {
        let mut contact = NewContact::default();
        let mut first_name = None;
        let mut last_name = None;
        let mut extra = Map::new();

        for ((header, field), raw) in self.headers.iter().zip(&self.fields).zip(values) {
            let value = raw.trim();
            if value.is_empty() {
                continue;
            }
            let slot = match field {
                Some(Field::Name) => &mut contact.name,
                Some(Field::FirstName) => &mut first_name,
                Some(Field::LastName) => &mut last_name,
                Some(Field::Email) => &mut contact.email,
                Some(Field::Phone) => &mut contact.phone,
                Some(Field::Company) => &mut contact.company,
                Some(Field::Title) => &mut contact.title,
                Some(Field::LinkedinUrl) => &mut contact.linkedin_url,
                Some(Field::Location) => &mut contact.location,
                None => {
                    if !header.is_empty() {
                        extra.insert(header.clone(), Value::String(value.to_string()));
                    }
                    continue;
                }
            };
            if slot.is_none() {
                *slot = Some(value.to_string());
            }
        }

        if contact.name.is_none() {
            let joined = [first_name, last_name]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join(" ");
            if !joined.is_empty() {
                contact.name = Some(joined);
            }
        }
        if !extra.is_empty() {
            contact.extra = Some(Value::Object(extra).to_string());
        }

        contact.dedup_key = dedup_key(&contact)?;
        Some(contact)
    }
}

/// Natural key for a contact, see module docs for precedence.
pub fn dedup_key(contact: &NewContact) -> Option<String> {
    if let Some(email) = contact.email.as_deref() {
        let email = email.trim().to_lowercase();
        if email.contains('@') {
            return Some(format!("email:{email}"));
        }
    }
    if let Some(url) = contact.linkedin_url.as_deref() {
        let url = normalize_url(url);
        if !url.is_empty() {
            return Some(format!("linkedin:{url}"));
        }
    }
    let name = collapse(contact.name.as_deref().unwrap_or_default());
    if name.is_empty() {
        return None;
    }
    let company = collapse(contact.company.as_deref().unwrap_or_default());
    Some(format!("name:{name}|{company}"))
}

fn collapse(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn normalize_url(url: &str) -> String {
    let lower = url.trim().to_lowercase();
    let without_scheme = lower
        .strip_prefix("https://")
        .or_else(|| lower.strip_prefix("http://"))
        .unwrap_or(&lower);
    let without_www = without_scheme
        .strip_prefix("www.")
        .unwrap_or(without_scheme);
    let without_query = without_www
        .split(['?', '#'])
        .next()
        .unwrap_or(without_www);
    without_query.trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper(headers: &[&str]) -> RowMapper {
        RowMapper::new(headers.iter().map(|h| normalize_header(h)).collect())
    }

    fn row(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn headers_are_trimmed_and_lowercased() {
        assert_eq!(normalize_header("  Email Address "), "email address");
        assert_eq!(normalize_header("\u{feff}Name"), "name");
    }

    #[test]
    fn maps_aliases_and_keeps_unknown_columns() {
        let m = mapper(&["First Name", "Last-Name", "E-mail", "Job Title", "Favourite Color"]);
        let c = m
            .map(&row(&["Ada", "Lovelace", " ADA@Example.com ", "Analyst", "green"]))
            .unwrap();
        assert_eq!(c.name.as_deref(), Some("Ada Lovelace"));
        assert_eq!(c.email.as_deref(), Some("ADA@Example.com"));
        assert_eq!(c.title.as_deref(), Some("Analyst"));
        assert_eq!(c.dedup_key, "email:ada@example.com");
        assert_eq!(c.extra.as_deref(), Some(r#"{"favourite color":"green"}"#));
    }

    #[test]
    fn falls_back_to_linkedin_then_name_and_company() {
        let m = mapper(&["name", "company", "email", "linkedin"]);

        let c = m
            .map(&row(&["Grace", "Navy", "", "https://www.LinkedIn.com/in/grace/?trk=x"]))
            .unwrap();
        assert_eq!(c.dedup_key, "linkedin:linkedin.com/in/grace");

        let c = m
            .map(&row(&["  Grace   Hopper ", "US  Navy", "not-an-email", ""]))
            .unwrap();
        assert_eq!(c.dedup_key, "name:grace hopper|us navy");
    }

    #[test]
    fn rows_without_identity_are_unkeyed() {
        let m = mapper(&["phone", "city"]);
        assert!(m.map(&row(&["555-0100", "Paris"])).is_none());
    }
}
