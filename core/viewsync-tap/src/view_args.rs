use clap::Args;
use viewsync_core::view::{StatusScope, ViewDescriptor};

/// Flags that select one view.
#[derive(Args, Debug, Clone)]
pub struct ViewArgs {
    /// Resource type the view lists
    #[arg(long)]
    pub resource: String,

    /// Status scope: active, inactive, deleted or all
    #[arg(long, default_value = "active", value_parser = parse_status)]
    pub status: StatusScope,

    /// Case-insensitive free-text search
    #[arg(long)]
    pub search: Option<String>,

    /// Exact column filter, repeatable
    #[arg(long = "filter", value_name = "COLUMN=VALUE", value_parser = parse_filter)]
    pub filters: Vec<(String, String)>,

    #[arg(long, default_value_t = 1)]
    pub page: u32,

    #[arg(long, default_value_t = 25)]
    pub page_size: u32,
}

impl ViewArgs {
    pub fn descriptor(&self) -> Result<ViewDescriptor, String> {
        let descriptor = ViewDescriptor::new(self.resource.as_str(), self.page_size)?
            .with_status(self.status)
            .with_search(self.search.as_deref())
            .with_filters(
                self.filters
                    .iter()
                    .map(|(column, value)| (column.as_str(), value.as_str())),
            )
            .with_page(self.page)?;
        Ok(descriptor)
    }
}

fn parse_status(value: &str) -> Result<StatusScope, String> {
    StatusScope::parse(value)
        .ok_or_else(|| format!("unknown status '{value}' (expected active, inactive, deleted or all)"))
}

fn parse_filter(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((column, filter)) if !column.trim().is_empty() => {
            Ok((column.trim().to_string(), filter.to_string()))
        }
        _ => Err(format!("filter '{value}' must look like COLUMN=VALUE")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_filters_with_equals_in_value() {
        assert_eq!(
            parse_filter("formula=a=b").expect("filter"),
            ("formula".to_string(), "a=b".to_string())
        );
        assert!(parse_filter("=x").is_err());
        assert!(parse_filter("plain").is_err());
    }

    #[test]
    fn rejects_unknown_status() {
        assert!(parse_status("archived").is_err());
        assert_eq!(parse_status("deleted").expect("status"), StatusScope::Deleted);
    }
}
