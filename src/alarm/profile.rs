//! Email credential profiles referenced by email action templates.

use uuid::Uuid;

use crate::xml::Element;

/// A named bundle of SMTP credentials and addresses. `unique_id` stays
/// stable across renames so action templates keep resolving.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmailProfile {
    pub unique_id: String,
    pub name: String,
    pub use_gateway: bool,
    pub smtp_server: String,
    pub smtp_user_name: String,
    pub smtp_password: String,
    pub from_address: String,
    pub to_address: String,
    pub cc_address: String,
    pub bcc_address: String,
}

impl EmailProfile {
    pub fn new() -> Self {
        Self {
            unique_id: Uuid::new_v4().to_string(),
            ..Default::default()
        }
    }

    pub fn read(elem: &Element) -> Self {
        let text = |name: &str| elem.find(name).map(Element::text).unwrap_or_default().to_string();
        Self {
            unique_id: elem
                .attr("unique-id")
                .map(str::to_string)
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            name: elem.attr("name").unwrap_or_default().to_string(),
            use_gateway: elem.attr("use-gateway") == Some("true"),
            smtp_server: text("smtp-server"),
            smtp_user_name: text("smtp-user-name"),
            smtp_password: text("smtp-password"),
            from_address: text("from-address"),
            to_address: text("to-address"),
            cc_address: text("cc-address"),
            bcc_address: text("bcc-address"),
        }
    }

    pub fn write(&self, elem: &mut Element) {
        elem.set_attr("unique-id", &self.unique_id);
        elem.set_attr("name", &self.name);
        elem.set_attr_bool("use-gateway", self.use_gateway);
        elem.add_element("smtp-server").set_text(&self.smtp_server);
        elem.add_element("smtp-user-name")
            .set_text(&self.smtp_user_name);
        elem.add_element("smtp-password")
            .set_text(&self.smtp_password);
        elem.add_element("from-address").set_text(&self.from_address);
        elem.add_element("to-address").set_text(&self.to_address);
        elem.add_element("cc-address").set_text(&self.cc_address);
        elem.add_element("bcc-address").set_text(&self.bcc_address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_xml() {
        let mut profile = EmailProfile::new();
        profile.name = "station ops".into();
        profile.use_gateway = false;
        profile.smtp_server = "mail.example.com:587".into();
        profile.smtp_user_name = "ops".into();
        profile.smtp_password = "hunter2".into();
        profile.from_address = "logger@example.com".into();
        profile.to_address = "oncall@example.com, lead@example.com".into();

        let mut elem = Element::new("EmailProfile");
        profile.write(&mut elem);
        let again = EmailProfile::read(&elem);
        assert_eq!(again, profile);
    }

    #[test]
    fn missing_unique_id_gets_generated() {
        let elem = Element::parse(r#"<EmailProfile name="x"/>"#).unwrap();
        let profile = EmailProfile::read(&elem);
        assert!(!profile.unique_id.is_empty());
        assert_eq!(profile.name, "x");
    }
}
