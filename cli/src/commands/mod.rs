mod helpers;
mod record;
mod sync;

pub(crate) use record::{
    AddArgs, UpdateArgs, cmd_add, cmd_delete, cmd_list, cmd_set_status, cmd_show, cmd_update,
    cmd_watch,
};
pub(crate) use sync::cmd_sync;
