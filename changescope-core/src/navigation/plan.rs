use changescope_model::{DatasetRecord, ImageVariant};

use super::DisplayRequest;
use crate::preload::PreloadRequest;

/// Speculative loads to issue after `request` is on screen, most useful
/// first: the entry's other variants (priority 2 and 3), then the same
/// variant of the next entry (4) and of the previous entry (5). The listing
/// does not wrap.
pub fn preload_plan(
    datasets: &[DatasetRecord],
    request: &DisplayRequest,
) -> Vec<PreloadRequest> {
    let mut plan = Vec::with_capacity(4);
    let Some(current) = datasets.get(request.index) else {
        return plan;
    };

    for (variant, priority) in request.variant.others().zip(2u8..) {
        plan.push(build(
            current,
            variant,
            request,
            priority,
            format!("preload-{}", variant.label()),
        ));
    }

    if let Some(next) = datasets.get(request.index + 1) {
        plan.push(build(
            next,
            request.variant,
            request,
            4,
            "preload-next".into(),
        ));
    }

    if let Some(previous) = request
        .index
        .checked_sub(1)
        .and_then(|index| datasets.get(index))
    {
        plan.push(build(
            previous,
            request.variant,
            request,
            5,
            "preload-prev".into(),
        ));
    }

    plan
}

fn build(
    record: &DatasetRecord,
    variant: ImageVariant,
    request: &DisplayRequest,
    priority: u8,
    context: String,
) -> PreloadRequest {
    let image = record.image_ref(
        variant,
        request.full_resolution,
        request.veg_filter,
    );
    PreloadRequest {
        url: image.url,
        key: image.key,
        priority,
        context,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use changescope_model::VariantSource;

    fn record(id: u64) -> DatasetRecord {
        DatasetRecord {
            id,
            name: None,
            pre_event: VariantSource::from(format!("{id}/pre.png").as_str()),
            post_event: VariantSource::from(format!("{id}/post.png").as_str()),
            change_detection: VariantSource::from(
                format!("{id}/change.png").as_str(),
            ),
            has_vegetation_filter: false,
        }
    }

    fn request(index: usize, variant: ImageVariant) -> DisplayRequest {
        DisplayRequest {
            index,
            variant,
            full_resolution: false,
            veg_filter: false,
        }
    }

    #[test]
    fn middle_entry_gets_full_plan() {
        let datasets: Vec<_> = (0..3).map(record).collect();
        let plan =
            preload_plan(&datasets, &request(1, ImageVariant::PostEvent));

        let summary: Vec<(&str, u8, &str)> = plan
            .iter()
            .map(|p| (p.url.as_str(), p.priority, p.context.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("1/pre.png", 2, "preload-pre"),
                ("1/change.png", 3, "preload-change"),
                ("2/post.png", 4, "preload-next"),
                ("0/post.png", 5, "preload-prev"),
            ]
        );
    }

    #[test]
    fn edges_do_not_wrap() {
        let datasets: Vec<_> = (0..3).map(record).collect();

        let first =
            preload_plan(&datasets, &request(0, ImageVariant::PreEvent));
        assert!(first.iter().all(|p| p.context != "preload-prev"));
        assert_eq!(first.len(), 3);

        let last =
            preload_plan(&datasets, &request(2, ImageVariant::PreEvent));
        assert!(last.iter().all(|p| p.context != "preload-next"));
        assert_eq!(last.len(), 3);
    }

    #[test]
    fn out_of_range_request_plans_nothing() {
        let datasets: Vec<_> = (0..2).map(record).collect();
        let beyond = request(7, ImageVariant::PreEvent);
        assert!(preload_plan(&datasets, &beyond).is_empty());
    }
}
