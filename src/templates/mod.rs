// HTML templates for the web server

use uploader_core::Theme;

/// Update page template, `{{theme}}` and `{{version}}` are substituted
pub const UPDATE_PAGE: &str = include_str!("update.html");

/// Render the update page for the configured theme
pub fn render_update_page(theme: Theme, version: &str) -> String {
    let theme_class = match theme {
        Theme::Light => "light",
        Theme::Dark => "dark",
    };
    UPDATE_PAGE
        .replace("{{theme}}", theme_class)
        .replace("{{version}}", version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_update_page() {
        let html = render_update_page(Theme::Dark, "v0.3.0-rust");
        assert!(html.contains(r#"<body class="dark">"#));
        assert!(html.contains("Running v0.3.0-rust"));
        assert!(!html.contains("{{"));
    }

    #[test]
    fn test_page_posts_to_upload_endpoint() {
        assert!(UPDATE_PAGE.contains("/ota/upload?mode="));
        assert!(UPDATE_PAGE.contains("form.append('update'"));
    }
}
