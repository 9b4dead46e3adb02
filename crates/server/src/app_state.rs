use panel_api::PanelContext;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) api: PanelContext,
}
