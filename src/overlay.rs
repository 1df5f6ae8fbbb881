use crate::trace_store::{CellId, TraceSet};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarkerState {
    Neutral,
    /// The currently selected cell.
    Active,
    /// Marked bad; wins over selection.
    Excluded,
}

impl MarkerState {
    pub fn resolve(good: bool, selected: bool) -> Self {
        match (good, selected) {
            (false, _) => Self::Excluded,
            (true, true) => Self::Active,
            (true, false) => Self::Neutral,
        }
    }

    pub fn rgba(self) -> [u8; 4] {
        match self {
            Self::Neutral => [56, 189, 248, 255],
            Self::Active => [250, 204, 21, 255],
            Self::Excluded => [239, 68, 68, 255],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OverlayMarker {
    pub cell_id: CellId,
    pub x: f64,
    pub y: f64,
    pub state: MarkerState,
}

/// One marker per trace observed at `frame`, in trace-store order.
pub fn markers_for_frame(
    traces: &TraceSet,
    frame: usize,
    selected: Option<CellId>,
) -> Vec<OverlayMarker> {
    traces
        .iter()
        .filter_map(|trace| {
            let (x, y) = trace.position_at(frame)?;
            Some(OverlayMarker {
                cell_id: trace.cell_id,
                x,
                y,
                state: MarkerState::resolve(trace.is_good(), selected == Some(trace.cell_id)),
            })
        })
        .collect()
}

/// Closest marker within `max_distance` of the click; the first one wins a tie.
pub fn nearest(
    markers: &[OverlayMarker],
    click_x: f64,
    click_y: f64,
    max_distance: f64,
) -> Option<CellId> {
    let mut best: Option<(f64, CellId)> = None;
    for marker in markers {
        let d2 = (marker.x - click_x).powi(2) + (marker.y - click_y).powi(2);
        if best.map(|(b, _)| d2 < b).unwrap_or(true) {
            best = Some((d2, marker.cell_id));
        }
    }
    let (d2, cell_id) = best?;
    (d2.sqrt() <= max_distance).then_some(cell_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marker(cell: u32, x: f64, y: f64) -> OverlayMarker {
        OverlayMarker {
            cell_id: CellId::new(0, cell),
            x,
            y,
            state: MarkerState::Neutral,
        }
    }

    fn traces() -> TraceSet {
        let text = "\
fov,cell,frame,value,x,y,good
0,1,0,1.0,10,10,true
0,1,1,1.0,11,11,true
0,2,1,2.0,100,100,false
0,3,0,3.0,40,40,true
";
        TraceSet::load(text).unwrap().0
    }

    #[test]
    fn test_nearest_selects_close_marker() {
        let markers = vec![marker(1, 10.0, 10.0), marker(2, 100.0, 100.0)];
        assert_eq!(nearest(&markers, 12.0, 11.0, 20.0), Some(CellId::new(0, 1)));
    }

    #[test]
    fn test_nearest_misses_between_markers() {
        let markers = vec![marker(1, 10.0, 10.0), marker(2, 100.0, 100.0)];
        assert_eq!(nearest(&markers, 60.0, 60.0, 20.0), None);
    }

    #[test]
    fn test_nearest_tie_goes_to_first_marker() {
        let markers = vec![marker(5, 0.0, 10.0), marker(6, 0.0, -10.0)];
        assert_eq!(nearest(&markers, 0.0, 0.0, 10.0), Some(CellId::new(0, 5)));
    }

    #[test]
    fn test_nearest_on_empty_set() {
        assert_eq!(nearest(&[], 1.0, 1.0, 100.0), None);
    }

    #[test]
    fn test_markers_only_for_cells_present_at_frame() {
        let set = traces();
        let frame0 = markers_for_frame(&set, 0, None);
        assert_eq!(
            frame0.iter().map(|m| m.cell_id.cell).collect::<Vec<_>>(),
            vec![1, 3]
        );
        let frame1 = markers_for_frame(&set, 1, None);
        assert_eq!(frame1.len(), 2);
        assert_eq!((frame1[0].x, frame1[0].y), (11.0, 11.0));
        assert!(markers_for_frame(&set, 7, None).is_empty());
    }

    #[test]
    fn test_marker_states_follow_quality_and_selection() {
        let set = traces();
        let markers = markers_for_frame(&set, 1, Some(CellId::new(0, 1)));
        assert_eq!(markers[0].state, MarkerState::Active);
        assert_eq!(markers[1].state, MarkerState::Excluded);

        let markers = markers_for_frame(&set, 1, Some(CellId::new(0, 2)));
        assert_eq!(markers[0].state, MarkerState::Neutral);
        assert_eq!(markers[1].state, MarkerState::Excluded);
    }
}
