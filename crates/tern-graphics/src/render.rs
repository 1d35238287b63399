//! Render-list records for the layer builder.
//!
//! [`GraphicsManager::update_layers`](crate::GraphicsManager::update_layers)
//! produces one [`ImageRenderData`] per visible placement; the records
//! here are pure values the renderer can hand to the GPU without
//! reaching back into manager state.

use crate::types::Rect;

/// One textured quad of the render list.
#[derive(Debug, Clone, Default)]
pub struct ImageRenderData {
    /// Four vertices of `(u, v, x, y)` — texture UV then NDC position —
    /// in top-right, bottom-right, bottom-left, top-left order.
    pub vertices: [f32; 16],
    /// Draw layer; the list is sorted by (z_index, image_id).
    pub z_index: i32,
    /// Internal id of the source image; equal ids form contiguous runs.
    pub image_id: u64,
    /// GPU texture backing the quad.
    pub texture_id: u32,
    /// On the first record of a same-image run, the run length; 0 on
    /// followers. Lets the renderer bind each texture once per run.
    pub group_count: u32,
}

/// Interleave a UV rectangle and an NDC rectangle into the vertex quad.
pub(crate) fn vertex_quad(src: &Rect, dest: &Rect) -> [f32; 16] {
    [
        src.right, src.top, dest.right, dest.top, // top-right
        src.right, src.bottom, dest.right, dest.bottom, // bottom-right
        src.left, src.bottom, dest.left, dest.bottom, // bottom-left
        src.left, src.top, dest.left, dest.top, // top-left
    ]
}

/// Sort into draw order. (z_index, image_id) is a total order over the
/// working set, so an unstable sort suffices.
pub(crate) fn sort_for_draw_order(data: &mut [ImageRenderData]) {
    data.sort_unstable_by(|a, b| {
        a.z_index
            .cmp(&b.z_index)
            .then(a.image_id.cmp(&b.image_id))
    });
}

/// Walk a draw-ordered list and store each same-image run's length on
/// its first record.
pub(crate) fn assign_group_counts(data: &mut [ImageRenderData]) {
    let mut i = 0;
    while i < data.len() {
        let start = i;
        let image_id = data[start].image_id;
        i += 1;
        while i < data.len() && data[i].image_id == image_id {
            i += 1;
        }
        data[start].group_count = (i - start) as u32;
    }
}

/// A quad that centers an image in the viewport, scaled down (never up)
/// to fit. Used for splash-style images outside the grid flow.
pub fn render_data_for_centered_image(
    screen_width_px: u32,
    screen_height_px: u32,
    width: u32,
    height: u32,
) -> ImageRenderData {
    let src = Rect {
        left: 0.0,
        top: 0.0,
        right: 1.0,
        bottom: 1.0,
    };
    let width_frac = 2.0 * (width as f32 / screen_width_px as f32).min(1.0);
    let height_frac = 2.0 * (height as f32 / screen_height_px as f32).min(1.0);
    let hmargin = (2.0 - width_frac) / 2.0;
    let vmargin = (2.0 - height_frac) / 2.0;
    let dest = Rect {
        left: -1.0 + hmargin,
        right: -1.0 + hmargin + width_frac,
        top: 1.0 - vmargin,
        bottom: 1.0 - vmargin - height_frac,
    };
    ImageRenderData {
        vertices: vertex_quad(&src, &dest),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rd(z_index: i32, image_id: u64) -> ImageRenderData {
        ImageRenderData {
            z_index,
            image_id,
            ..Default::default()
        }
    }

    #[test]
    fn test_vertex_quad_corner_order() {
        let src = Rect {
            left: 0.0,
            top: 0.25,
            right: 0.5,
            bottom: 1.0,
        };
        let dest = Rect {
            left: -1.0,
            top: 1.0,
            right: 0.0,
            bottom: -0.5,
        };
        let v = vertex_quad(&src, &dest);
        // top-right
        assert_eq!(&v[0..4], &[0.5, 0.25, 0.0, 1.0]);
        // bottom-right
        assert_eq!(&v[4..8], &[0.5, 1.0, 0.0, -0.5]);
        // bottom-left
        assert_eq!(&v[8..12], &[0.0, 1.0, -1.0, -0.5]);
        // top-left
        assert_eq!(&v[12..16], &[0.0, 0.25, -1.0, 1.0]);
    }

    #[test]
    fn test_draw_order_sorts_by_z_then_image() {
        let mut data = vec![rd(1, 2), rd(-3, 9), rd(1, 1), rd(0, 5)];
        sort_for_draw_order(&mut data);
        let order: Vec<(i32, u64)> = data.iter().map(|d| (d.z_index, d.image_id)).collect();
        assert_eq!(order, vec![(-3, 9), (0, 5), (1, 1), (1, 2)]);
    }

    #[test]
    fn test_group_counts_on_run_heads() {
        let mut data = vec![rd(0, 1), rd(0, 1), rd(0, 1), rd(0, 2), rd(1, 3), rd(1, 3)];
        assign_group_counts(&mut data);
        let counts: Vec<u32> = data.iter().map(|d| d.group_count).collect();
        assert_eq!(counts, vec![3, 0, 0, 1, 2, 0]);
    }

    #[test]
    fn test_group_count_single_record() {
        let mut data = vec![rd(0, 7)];
        assign_group_counts(&mut data);
        assert_eq!(data[0].group_count, 1);
    }

    #[test]
    fn test_centered_image_fills_screen_when_larger() {
        let data = render_data_for_centered_image(800, 600, 1600, 1200);
        // dest rect occupies all of NDC
        assert_eq!(&data.vertices[2..4], &[1.0, 1.0]); // top-right (x, y)
        assert_eq!(&data.vertices[10..12], &[-1.0, -1.0]); // bottom-left (x, y)
    }

    #[test]
    fn test_centered_image_half_size() {
        let data = render_data_for_centered_image(800, 600, 400, 300);
        // Half the screen in each axis, centered.
        assert_eq!(&data.vertices[2..4], &[0.5, 0.5]); // top-right
        assert_eq!(&data.vertices[10..12], &[-0.5, -0.5]); // bottom-left
    }
}
