use std::fmt;

/// One of the three images published for every dataset entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "camelCase")
)]
pub enum ImageVariant {
    /// Imagery captured before the event.
    #[default]
    PreEvent,
    /// Imagery captured after the event.
    PostEvent,
    /// Derived overlay highlighting detected change.
    ChangeDetection,
}

impl ImageVariant {
    /// Every variant in display order.
    pub const ALL: [ImageVariant; 3] = [
        ImageVariant::PreEvent,
        ImageVariant::PostEvent,
        ImageVariant::ChangeDetection,
    ];

    /// Short stable label used in logs and preload contexts.
    pub const fn label(self) -> &'static str {
        match self {
            ImageVariant::PreEvent => "pre",
            ImageVariant::PostEvent => "post",
            ImageVariant::ChangeDetection => "change",
        }
    }

    /// The two variants that are not `self`, in display order.
    pub fn others(self) -> impl Iterator<Item = ImageVariant> {
        Self::ALL.into_iter().filter(move |variant| *variant != self)
    }
}

impl fmt::Display for ImageVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
