/// Tag names the scanner understands. Everything else is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    /// `d`: identifier of an announced service
    ServiceId,
    /// `k`: job kind a vendor says it supports
    SupportedKind,
    /// `p`: public key the event is addressed to
    PubkeyRef,
}

impl TagKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "d" => Some(TagKind::ServiceId),
            "k" => Some(TagKind::SupportedKind),
            "p" => Some(TagKind::PubkeyRef),
            _ => None,
        }
    }
}

/// A recognised tag and its value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypedTag<'a> {
    pub kind: TagKind,
    pub value: &'a str,
}

/// Resolve a raw tag. Unknown names and tags without a value yield `None`.
pub fn classify(tag: &[String]) -> Option<TypedTag<'_>> {
    match tag {
        [name, value, ..] => TagKind::from_name(name).map(|kind| TypedTag {
            kind,
            value: value.as_str(),
        }),
        _ => None,
    }
}

/// Iterate over the recognised tags of an event in order
pub fn typed_tags(tags: &[Vec<String>]) -> impl Iterator<Item = TypedTag<'_>> {
    tags.iter().filter_map(|tag| classify(tag))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn known_names_resolve() {
        assert_eq!(
            classify(&tag(&["d", "svc1"])),
            Some(TypedTag {
                kind: TagKind::ServiceId,
                value: "svc1"
            })
        );
        assert_eq!(
            classify(&tag(&["k", "5000"])).map(|t| t.kind),
            Some(TagKind::SupportedKind)
        );
        assert_eq!(
            classify(&tag(&["p", "abc", "wss://relay"])).map(|t| t.value),
            Some("abc")
        );
    }

    #[test]
    fn unknown_and_short_tags_are_ignored() {
        assert_eq!(classify(&tag(&["t", "ai"])), None);
        assert_eq!(classify(&tag(&["d"])), None);
        assert_eq!(classify(&[]), None);

        let tags = vec![tag(&["e", "x"]), tag(&["d", "a"]), tag(&["p"]), tag(&["d", "b"])];
        let values: Vec<_> = typed_tags(&tags).map(|t| t.value).collect();
        assert_eq!(values, vec!["a", "b"]);
    }
}
